//! Command-line interface for the Fleexa message validation engine.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleexa_core::config::env_vars;
use fleexa_core::EngineConfig;
use fleexa_devices::{
    parse_topic, Channel, CommandRequest, CommandRoute, DeviceStateCache, DeviceTypeRegistry,
    InboundMessage, IngestService, MemoryCommandLog, MemoryRecordSink, MemoryTransport, Router,
    SharedRegistry,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Exit code for a message or command the engine rejected.
const EXIT_REJECTED: u8 = 2;

/// Fleexa - validate and route IoT device messages.
#[derive(Parser, Debug)]
#[command(name = "fleexa")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (defaults to ./fleexa.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// List registered device types, their channels and actions.
    Types {
        /// Print the definitions as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Load and validate a device type configuration file.
    CheckConfig {
        /// TOML or JSON registry file.
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Route one message and print the record or the rejection.
    Route {
        /// Topic, e.g. devices/temp-sensor-01/telemetry.
        #[arg(short, long)]
        topic: String,

        /// Raw message payload.
        #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
        payload: Option<String>,

        /// Read the payload from a file.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Validate a command and print the message to publish.
    Command {
        /// Target device id.
        #[arg(short, long)]
        device: String,

        /// Action name, e.g. LOCK.
        #[arg(short, long)]
        action: String,

        /// Parameter as key=value; values are read as JSON when they parse, strings otherwise.
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Idempotency key (a UUID is generated when omitted).
        #[arg(long)]
        request_id: Option<String>,

        /// Print the desired-state document instead of the plain command.
        #[arg(long)]
        shadow: bool,
    },

    /// Feed a JSON-lines capture of {"topic", "payload"} records through the ingest service.
    Replay {
        /// Capture file.
        #[arg(required = true)]
        file: PathBuf,

        /// Messages processed at once.
        #[arg(long, default_value_t = 16)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Types { json } => list_types(&config, json),
        Command::CheckConfig { file } => check_config(&file),
        Command::Route {
            topic,
            payload,
            file,
        } => {
            let raw = match (payload, file) {
                (Some(payload), _) => payload.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("either --payload or --file is required"),
            };
            route(&config, &topic, &raw)
        }
        Command::Command {
            device,
            action,
            params,
            request_id,
            shadow,
        } => {
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let request = params
                .into_iter()
                .fold(CommandRequest::new(request_id, action), |req, (k, v)| {
                    req.with_param(k, v)
                });
            command(&config, &device, &request, shadow)
        }
        Command::Replay { file, concurrency } => replay(&config, &file, concurrency).await,
    }
}

/// Initialize logging. Logs go to stderr so command output stays parseable.
fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "fleexa=debug" } else { "fleexa=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(default_level).add_directive(tracing::Level::WARN.into())
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = EngineConfig::load(path).context("Failed to load engine configuration")?;
    tracing::debug!(?config, "Engine configuration loaded");
    Ok(config)
}

fn load_registry(config: &EngineConfig) -> Result<DeviceTypeRegistry> {
    match &config.device_types_path {
        Some(path) => DeviceTypeRegistry::load(path)
            .with_context(|| format!("Failed to load device types from {}", path.display())),
        None => Ok(DeviceTypeRegistry::builtin()),
    }
}

fn build_router(config: &EngineConfig) -> Result<Router> {
    let registry = load_registry(config)?;
    Ok(Router::new(SharedRegistry::new(registry), config))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_types(config: &EngineConfig, as_json: bool) -> Result<ExitCode> {
    let registry = load_registry(config)?;

    if as_json {
        print_json(&registry.device_types())?;
        return Ok(ExitCode::SUCCESS);
    }

    let names = |fields: &[fleexa_devices::FieldDefinition]| {
        fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
    };

    for def in registry.device_types() {
        if def.category.is_empty() {
            println!("{}  {}", def.type_id, def.name);
        } else {
            println!("{}  {} ({})", def.type_id, def.name, def.category);
        }
        println!("  telemetry: {}", names(def.telemetry.fields()));
        match &def.alerts {
            Some(alerts) => println!("  alerts:    {}", names(alerts.fields())),
            None => println!("  alerts:    (none)"),
        }
        let actions: Vec<_> = def.commands.iter().map(|c| c.action.as_str()).collect();
        println!("  commands:  {}", actions.join(", "));
    }

    Ok(ExitCode::SUCCESS)
}

fn check_config(file: &Path) -> Result<ExitCode> {
    let registry = DeviceTypeRegistry::load(file)
        .with_context(|| format!("Invalid device type configuration {}", file.display()))?;

    let ids: Vec<_> = registry.device_types().iter().map(|d| d.type_id.clone()).collect();
    println!("OK: {} device types ({})", registry.len(), ids.join(", "));
    Ok(ExitCode::SUCCESS)
}

fn route(config: &EngineConfig, topic: &str, raw: &[u8]) -> Result<ExitCode> {
    let router = build_router(config)?;

    // Command topics carry bare commands, not envelopes.
    if let Ok((_, Channel::Command)) = parse_topic(topic) {
        return match router.route_command(topic, raw) {
            Ok(route) => print_command_route(&route, false),
            Err(rejection) => {
                print_json(&json!({
                    "topic": topic,
                    "reason": rejection.code(),
                    "detail": rejection.to_string(),
                }))?;
                Ok(ExitCode::from(EXIT_REJECTED))
            }
        };
    }

    match router.route_upstream(topic, raw) {
        Ok(record) => {
            print_json(&record)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(rejected) => {
            print_json(&rejected.to_json())?;
            Ok(ExitCode::from(EXIT_REJECTED))
        }
    }
}

fn command(
    config: &EngineConfig,
    device_id: &str,
    request: &CommandRequest,
    shadow: bool,
) -> Result<ExitCode> {
    let router = build_router(config)?;

    match router.route_downstream(request, device_id) {
        Ok(route) => print_command_route(&route, shadow),
        Err(rejection) => {
            print_json(&json!({
                "device_id": device_id,
                "request_id": request.request_id,
                "reason": rejection.code(),
                "detail": rejection.to_string(),
            }))?;
            Ok(ExitCode::from(EXIT_REJECTED))
        }
    }
}

fn print_command_route(route: &CommandRoute, shadow: bool) -> Result<ExitCode> {
    match route {
        CommandRoute::Accepted(outbound) => {
            let payload = if shadow {
                outbound.shadow_delta()
            } else {
                outbound.to_json()
            };
            print_json(&json!({
                "outcome": "accepted",
                "topic": outbound.topic,
                "payload": payload,
            }))?;
        }
        CommandRoute::Duplicate {
            device_id,
            request_id,
        } => {
            print_json(&json!({
                "outcome": "duplicate",
                "device_id": device_id,
                "request_id": request_id,
            }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// One line of a replay capture.
#[derive(Debug, Deserialize)]
struct CapturedMessage {
    topic: String,
    /// Raw payload string, or a JSON value sent as its serialization
    payload: Value,
}

impl CapturedMessage {
    fn into_inbound(self) -> InboundMessage {
        let payload = match self.payload {
            Value::String(raw) => raw.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        InboundMessage::new(self.topic, payload)
    }
}

async fn replay(config: &EngineConfig, file: &Path, concurrency: usize) -> Result<ExitCode> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut messages = Vec::new();
    let mut skipped = 0usize;
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CapturedMessage>(line) {
            Ok(msg) => messages.push(msg.into_inbound()),
            Err(e) => {
                tracing::warn!(line = line_no + 1, error = %e, "Skipping unparseable capture line");
                skipped += 1;
            }
        }
    }

    let telemetry = Arc::new(MemoryRecordSink::new("telemetry"));
    let alerts = Arc::new(MemoryRecordSink::new("alerts"));
    let states = Arc::new(DeviceStateCache::new());
    let service = IngestService::new(
        Arc::new(build_router(config)?),
        telemetry.clone(),
        alerts.clone(),
        Arc::new(MemoryCommandLog::new()),
        Arc::new(MemoryTransport::new()),
    )
    .with_state_cache(states.clone())
    .with_concurrency(concurrency);

    let (tx, rx) = mpsc::channel(concurrency.max(1) * 4);
    let total = messages.len();
    let producer = async move {
        for msg in messages {
            if tx.send(msg).await.is_err() {
                break;
            }
        }
    };
    tokio::join!(producer, service.run(rx));

    print_json(&json!({
        "messages": total,
        "skipped_lines": skipped,
        "devices": states.device_ids(),
        "stats": service.stats(),
    }))?;
    Ok(ExitCode::SUCCESS)
}

/// Parse a `key=value` command parameter.
fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid parameter '{}': expected key=value", s))?;
    if key.is_empty() {
        return Err(format!("invalid parameter '{}': empty key", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("force=true").unwrap(), ("force".into(), json!(true)));
        assert_eq!(parse_param("target_temp=22.5").unwrap(), ("target_temp".into(), json!(22.5)));
        assert_eq!(parse_param("power=ON").unwrap(), ("power".into(), json!("ON")));
        assert_eq!(parse_param("note=a=b").unwrap(), ("note".into(), json!("a=b")));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "fleexa", "command", "--device", "door-actuator-02", "--action", "LOCK", "--param", "force=true",
        ])
        .unwrap();
        match args.command {
            Command::Command { params, request_id, .. } => {
                assert_eq!(params.len(), 1);
                assert!(request_id.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Args::try_parse_from(["fleexa", "route", "--topic", "t"]).is_err());
    }
}
