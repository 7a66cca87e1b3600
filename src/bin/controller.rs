use clap::{App, Arg};
use glucoloop::{BusMessage, BusPublisher, ControllerConfig, DoseController, MessageBus};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "glucoloop.toml";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("glucoloop-controller")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Closed-loop dose controller with a line-delimited JSON bus gateway")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Controller configuration (TOML)")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Gateway bind address")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Gateway port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG);
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;

    println!("Glucoloop dose controller");
    println!("=========================");

    let config = ControllerConfig::load(config_path)?;
    info!(
        config = config_path,
        patients = config.patients.len(),
        default_profile = config.default_profile.is_some(),
        policy = ?config.controller.over_limit_policy,
        decay = ?config.controller.iob_decay,
        "configuration loaded"
    );

    let bus = MessageBus::new(config.controller.bus_capacity);
    let inbound = bus.subscribe();
    let controller = DoseController::new(config, BusPublisher::new(bus.clone()));

    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    info!("gateway listening on {}:{}", host, port);

    let gateway_bus = bus.clone();
    let gateway = tokio::spawn(async move {
        if let Err(e) = serve_gateway(listener, gateway_bus).await {
            error!("gateway error: {}", e);
        }
    });

    let stats = controller
        .run_until(inbound, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    gateway.abort();

    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("Dose controller stopped");

    Ok(())
}

async fn serve_gateway(listener: TcpListener, bus: MessageBus) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("client connected: {}", addr);
                let client_bus = bus.clone();
                let outbound = bus.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_bus, outbound).await {
                        warn!("client {} error: {}", addr, e);
                    }
                    info!("client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

/// Lines read from the client are published onto the bus; every bus message
/// is streamed back, so clients see commands and alerts as they happen.
async fn handle_client(
    stream: TcpStream,
    bus: MessageBus,
    mut outbound: broadcast::Receiver<BusMessage>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let stream_writer = Arc::clone(&writer);
    let stream_task = tokio::spawn(async move {
        loop {
            let message = match outbound.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "client lagging behind the bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let Ok(line) = serde_json::to_string(&message) else {
                continue;
            };

            let mut guard = stream_writer.lock().await;
            if let Err(e) = guard.write_all(line.as_bytes()).await {
                warn!("failed to stream bus message: {}", e);
                break;
            }
            if let Err(e) = guard.write_all(b"\n").await {
                warn!("failed to stream bus message newline: {}", e);
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                match serde_json::from_str::<BusMessage>(trimmed) {
                    Ok(message) => {
                        info!(topic = %message.topic, "inbound message");
                        if let Err(e) = bus.publish(message) {
                            warn!("failed to publish inbound message: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("invalid envelope: {}", e);
                        let reply = serde_json::json!({
                            "error": format!("invalid envelope: {e}"),
                        });
                        let mut guard = writer.lock().await;
                        guard.write_all(reply.to_string().as_bytes()).await?;
                        guard.write_all(b"\n").await?;
                    }
                }
            }
            Err(e) => {
                error!("error reading from client: {}", e);
                break;
            }
        }
    }

    stream_task.abort();
    Ok(())
}
