use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use glucoloop::senml::{SenmlPack, SenmlValue};
use glucoloop::telemetry::PumpState;
use glucoloop::{BusMessage, GlucoseReading, PumpStatus, TopicKind, Trend};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_WAIT_MS: &str = "500";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("glucoloop")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sensor and pump console for the glucoloop dose controller")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Controller gateway address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Controller gateway port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("wait")
                .short("w")
                .long("wait")
                .value_name("MS")
                .help("How long to listen for commands and alerts after sending")
                .takes_value(true)
                .default_value(DEFAULT_WAIT_MS)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("reading")
                .about("Send a glucose sensor reading")
                .arg(patient_arg())
                .arg(
                    Arg::with_name("value")
                        .long("value")
                        .value_name("MG_DL")
                        .help("Glucose level in mg/dL")
                        .takes_value(true)
                        .required(true)
                        .validator(is_number),
                )
                .arg(
                    Arg::with_name("trend")
                        .long("trend")
                        .value_name("TREND")
                        .help("Sensor trend")
                        .takes_value(true)
                        .possible_values(&["rising_fast", "rising", "stable", "falling", "falling_fast"])
                        .default_value("stable"),
                )
                .arg(
                    Arg::with_name("battery")
                        .long("battery")
                        .value_name("PERCENT")
                        .help("Sensor battery")
                        .takes_value(true)
                        .default_value("100")
                        .validator(is_number),
                )
                .arg(at_arg()),
        )
        .subcommand(
            SubCommand::with_name("pump")
                .about("Send an insulin pump status report")
                .arg(patient_arg())
                .arg(
                    Arg::with_name("status")
                        .long("status")
                        .value_name("STATUS")
                        .help("Pump status")
                        .takes_value(true)
                        .possible_values(&["active", "alarm", "stopped", "alarm_cleared"])
                        .default_value("active"),
                )
                .arg(
                    Arg::with_name("reservoir")
                        .long("reservoir")
                        .value_name("UNITS")
                        .help("Insulin left in the reservoir")
                        .takes_value(true)
                        .default_value("200")
                        .validator(is_number),
                )
                .arg(
                    Arg::with_name("battery")
                        .long("battery")
                        .value_name("PERCENT")
                        .help("Pump battery")
                        .takes_value(true)
                        .default_value("100")
                        .validator(is_number),
                )
                .arg(
                    Arg::with_name("alarm")
                        .long("alarm")
                        .help("Set the alarm flag"),
                )
                .arg(at_arg()),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Stream pump commands and alerts (Press Ctrl+C to stop)")
                .arg(
                    Arg::with_name("patient")
                        .long("patient")
                        .value_name("ID")
                        .help("Only show this patient")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let wait = Duration::from_millis(matches.value_of("wait").unwrap_or(DEFAULT_WAIT_MS).parse::<u64>()?);

    match matches.subcommand() {
        ("reading", Some(sub_matches)) => {
            let reading = reading_from(sub_matches)?;
            let message = BusMessage::new(
                TopicKind::GlucoseReading.topic(&reading.patient_id),
                reading.to_senml().to_json()?,
            );
            println!(
                "{} {} {} mg/dL ({})",
                "📤".bright_blue(),
                reading.patient_id.bright_white(),
                reading.value_mg_dl.to_string().bright_cyan(),
                reading.trend.as_str()
            );
            send_and_listen(host, port, &message, Some(&reading.patient_id), wait, format).await?;
        }
        ("pump", Some(sub_matches)) => {
            let status = pump_status_from(sub_matches)?;
            let message = BusMessage::new(
                TopicKind::PumpStatus.topic(&status.patient_id),
                status.to_senml().to_json()?,
            );
            println!(
                "{} {} pump {} ({} U, {}%)",
                "📤".bright_blue(),
                status.patient_id.bright_white(),
                status.state.as_str().bright_cyan(),
                status.reservoir_units,
                status.battery_percent
            );
            send_and_listen(host, port, &message, Some(&status.patient_id), wait, format).await?;
        }
        ("watch", Some(sub_matches)) => {
            println!("{}", "📡 Watching commands and alerts (Press Ctrl+C to stop)...".bright_blue().bold());
            let stream = connect(host, port).await?;
            listen(stream, sub_matches.value_of("patient"), None, format).await?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the controller", "glucoloop-controller --config glucoloop.toml".bright_cyan());
            println!("  {} Send a reading", "glucoloop reading --patient p1 --value 280".bright_cyan());
            println!("  {} Watch commands and alerts", "glucoloop watch".bright_cyan());
        }
    }

    Ok(())
}

fn patient_arg() -> Arg<'static, 'static> {
    Arg::with_name("patient")
        .long("patient")
        .value_name("ID")
        .help("Patient id")
        .takes_value(true)
        .required(true)
}

fn at_arg() -> Arg<'static, 'static> {
    Arg::with_name("at")
        .long("at")
        .value_name("TIMESTAMP")
        .help("Measurement time (Unix milliseconds, default: now)")
        .takes_value(true)
        .validator(|v| match v.parse::<u64>() {
            Ok(_) => Ok(()),
            Err(_) => Err("Timestamp must be a valid number".into()),
        })
}

#[allow(clippy::needless_pass_by_value)]
fn is_number(v: String) -> Result<(), String> {
    match v.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(()),
        _ => Err(format!("{v} is not a number")),
    }
}

fn reading_from(matches: &ArgMatches<'_>) -> Result<GlucoseReading, Box<dyn std::error::Error>> {
    Ok(GlucoseReading {
        patient_id: matches.value_of("patient").unwrap_or_default().to_owned(),
        value_mg_dl: matches.value_of("value").unwrap_or_default().parse()?,
        trend: Trend::parse(matches.value_of("trend").unwrap_or("stable"))?,
        timestamp: timestamp_from(matches)?,
        battery_percent: matches.value_of("battery").unwrap_or("100").parse()?,
    })
}

fn pump_status_from(matches: &ArgMatches<'_>) -> Result<PumpStatus, Box<dyn std::error::Error>> {
    Ok(PumpStatus {
        patient_id: matches.value_of("patient").unwrap_or_default().to_owned(),
        state: PumpState::parse(matches.value_of("status").unwrap_or("active"))?,
        alarm: matches.is_present("alarm"),
        reservoir_units: matches.value_of("reservoir").unwrap_or("200").parse()?,
        battery_percent: matches.value_of("battery").unwrap_or("100").parse()?,
        timestamp: timestamp_from(matches)?,
    })
}

fn timestamp_from(matches: &ArgMatches<'_>) -> Result<u64, Box<dyn std::error::Error>> {
    match matches.value_of("at") {
        Some(at) => Ok(at.parse()?),
        None => Ok(SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()),
    }
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{host}:{port}");
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to dose controller at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Controller is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin glucoloop-controller".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

async fn send_and_listen(
    host: &str,
    port: u16,
    message: &BusMessage,
    patient: Option<&str>,
    wait: Duration,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = connect(host, port).await?;
    let line = serde_json::to_string(message)?;
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;

    listen(stream, patient, Some(wait), format).await
}

/// Prints pump commands and alerts echoed by the gateway, until `wait`
/// elapses or the connection closes.
async fn listen(
    stream: TcpStream,
    patient: Option<&str>,
    wait: Option<Duration>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(stream).lines();
    let deadline = wait.map(|w| tokio::time::Instant::now() + w);
    let mut shown = 0usize;

    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Ok(next) => next?,
                Err(_) => break,
            },
            None => lines.next_line().await?,
        };
        let Some(line) = next else {
            break;
        };

        let Ok(message) = serde_json::from_str::<BusMessage>(&line) else {
            println!("{} {}", "⚠️ ".yellow(), line.bright_red());
            continue;
        };
        let Some((topic_patient, kind)) = TopicKind::parse(&message.topic) else {
            continue;
        };
        if patient.is_some_and(|p| p != topic_patient) {
            continue;
        }
        if !matches!(kind, TopicKind::PumpCommand | TopicKind::Alert) {
            continue;
        }

        shown += 1;
        if format == "json" {
            println!("{line}");
        } else {
            print_message(topic_patient, kind, &message.payload);
        }
    }

    if wait.is_some() && shown == 0 && format != "json" {
        println!("{} {}", "✅".green(), "no command or alert".dimmed());
    }

    Ok(())
}

fn print_message(patient: &str, kind: TopicKind, payload: &str) {
    let Ok(pack) = SenmlPack::parse(payload) else {
        println!("{} {} {}", "⚠️ ".yellow(), patient.bright_white(), payload);
        return;
    };
    let records = pack.resolve();
    let text = |name: &str| {
        records.iter().find(|r| r.name == name).and_then(|r| match &r.value {
            SenmlValue::Text(s) => Some(s.clone()),
            _ => None,
        })
    };
    let number = |name: &str| {
        records.iter().find(|r| r.name == name).and_then(|r| match r.value {
            SenmlValue::Number(n) => Some(n),
            _ => None,
        })
    };

    match kind {
        TopicKind::PumpCommand => {
            println!(
                "{} {} {} {} U (#{})",
                "💉".bright_green(),
                patient.bright_white(),
                text("command").unwrap_or_default().bright_green().bold(),
                number("dose").unwrap_or_default().to_string().bright_cyan(),
                number("id").unwrap_or_default()
            );
        }
        TopicKind::Alert => {
            let severity = text("severity").unwrap_or_default();
            let label = match severity.as_str() {
                "critical" => severity.bright_red().bold(),
                "warning" => severity.yellow().bold(),
                _ => severity.bright_cyan(),
            };
            println!(
                "{} {} [{}] {}: {}",
                "🔔".yellow(),
                patient.bright_white(),
                label,
                text("type").unwrap_or_default().bright_white(),
                text("message").unwrap_or_default()
            );
        }
        TopicKind::GlucoseReading | TopicKind::PumpStatus => {}
    }
}
