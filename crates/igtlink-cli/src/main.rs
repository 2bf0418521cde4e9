//! igtlink command-line driver
//!
//! Runs OpenIGTLink connectors on a timer and logs what they report:
//! - `listen` / `connect`: a single server or client connector
//! - `run`: every connector from the configuration file, plus flag overrides
//! - `send`: connect, send one command, print the response

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use igtlink_connector::{
    Command, ConnectorConfig, ConnectorEvent, ConnectorHub, ConnectorSession, ConnectorState,
    DEFAULT_PORT, DeviceRegistry, HubConfig, SessionId,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_REPLY: &str = "<Command><Result success=\"true\"/></Command>";

/// OpenIGTLink connector driver
#[derive(Parser)]
#[command(name = "igtlink")]
#[command(about = "Run OpenIGTLink server and client connectors")]
#[command(version)]
#[command(after_help = "\
Examples:
  igtlink listen --port 18944             Wait for a client and log traffic
  igtlink connect --host localhost        Connect to a server and log traffic
  igtlink run                             Run connectors from connectors.json
  igtlink run --server 18944 --client tracker:18945 --persistent
  igtlink send --host localhost --name Get --param Name=Depth
")]
struct Cli {
    /// Timer period driving the connectors, in milliseconds
    #[arg(long, global = true, default_value_t = 10, value_name = "MS")]
    interval: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server connector
    Listen {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Run a client connector
    Connect {
        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Run connectors from a configuration file
    Run {
        /// Configuration file (defaults to the user config directory)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Add a server connector on this port
        #[arg(long, value_name = "PORT")]
        server: Vec<u16>,

        /// Add a client connector for this address
        #[arg(long, value_name = "HOST:PORT", value_parser = parse_address)]
        client: Vec<(String, u16)>,

        /// Make connectors added by flags persistent
        #[arg(long)]
        persistent: bool,

        /// Answer peer commands with this response text (a success result if empty)
        #[arg(long, value_name = "XML", num_args = 0..=1, default_missing_value = DEFAULT_REPLY)]
        reply: Option<String>,
    },

    /// Send one command and print the response
    Send {
        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Command name
        #[arg(long)]
        name: String,

        /// Full command document, replacing the generated one
        #[arg(long, value_name = "TEXT")]
        xml: Option<String>,

        /// Command parameter added to the generated document
        #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_parameter)]
        parameters: Vec<(String, String)>,

        /// Device name carried in the message header
        #[arg(long, default_value = "")]
        device: String,

        /// Seconds to wait for the response
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Connector name used in logs
    #[arg(long)]
    name: Option<String>,

    /// Keep the connector running across connection failures
    #[arg(long)]
    persistent: bool,

    /// Only accept messages for devices already known to the connector
    #[arg(long)]
    restrict_device_names: bool,

    /// Answer peer commands with this response text (a success result if empty)
    #[arg(long, value_name = "XML", num_args = 0..=1, default_missing_value = DEFAULT_REPLY)]
    reply: Option<String>,
}

impl SessionArgs {
    fn apply(self, mut config: ConnectorConfig) -> (ConnectorConfig, Option<String>) {
        if let Some(name) = self.name {
            config.name = name;
        }
        config.persistent = self.persistent;
        config.restrict_device_names = self.restrict_device_names;
        (config, self.reply)
    }
}

fn parse_address(s: &str) -> Result<(String, u16), String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got '{s}'"))?;
    if host.is_empty() {
        return Err(format!("missing host in '{s}'"));
    }
    let port = port.parse().map_err(|e| format!("invalid port '{port}': {e}"))?;
    Ok((host.to_string(), port))
}

fn parse_parameter(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    Ok((name.to_string(), value.to_string()))
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to a timestamped file as well.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("igtlink={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("igtlink-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Flushes on drop; the process lifetime is the logging lifetime
        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn registry() -> Arc<DeviceRegistry> {
    Arc::new(DeviceRegistry::with_builtin_devices())
}

/// Print one event and answer peer commands when a reply is configured.
fn handle_event(hub: &mut ConnectorHub, id: &SessionId, event: ConnectorEvent, reply: Option<&str>) {
    let Some(session) = hub.connector_mut(id) else {
        return;
    };
    let name = session.name().to_string();

    match event {
        ConnectorEvent::DeviceModified(key) => {
            let content = session
                .device(&key)
                .and_then(|d| d.content())
                .map(serde_json::to_string)
                .transpose();
            match content {
                Ok(Some(json)) => println!("[{name}] {key} {json}"),
                Ok(None) => println!("[{name}] {key} (no content)"),
                Err(e) => warn!("Failed to format {key}: {e}"),
            }
        }
        ConnectorEvent::DeviceAdded(key) => println!("[{name}] new device {key}"),
        ConnectorEvent::CommandReceived(mut command) => {
            println!(
                "[{name}] command {} #{}: {}",
                command.name(),
                command.query_id().unwrap_or_default(),
                command.command_text()
            );
            if let Some(text) = reply {
                command.set_response_text(text);
                if let Err(e) = session.send_command_response(&command) {
                    warn!("Failed to answer {}: {e}", command.name());
                }
            }
        }
        ConnectorEvent::CommandCompleted(command) => println!(
            "[{name}] command {} {}: {}",
            command.name(),
            command.status(),
            command.response_text()
        ),
        ConnectorEvent::CommandResponseReceived(command) => {
            debug!("[{name}] response for {}", command.name());
        }
        other => println!("[{name}] {}", other.name()),
    }
}

/// Drive every connector on the timer until interrupted.
async fn drive(mut hub: ConnectorHub, interval: Duration, reply: Option<&str>) -> Result<()> {
    hub.start_all().await;
    if hub.connectors().all(|s| s.state() == ConnectorState::Off) {
        bail!("No connector could be started");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                hub.periodic_process_all().await;
                for (id, event) in hub.drain_events() {
                    handle_event(&mut hub, &id, event, reply);
                }
                if hub.connectors().all(|s| s.state() == ConnectorState::Off) {
                    info!("All connectors stopped");
                    break;
                }
            }
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
        }
    }

    hub.stop_all();
    for (id, event) in hub.drain_events() {
        handle_event(&mut hub, &id, event, None);
    }
    Ok(())
}

async fn run_single(config: ConnectorConfig, interval: Duration, reply: Option<&str>) -> Result<()> {
    let mut hub = ConnectorHub::new(registry());
    hub.add_connector(config)?;
    drive(hub, interval, reply).await
}

async fn run_configured(
    path: Option<PathBuf>,
    servers: Vec<u16>,
    clients: Vec<(String, u16)>,
    persistent: bool,
) -> Result<ConnectorHub> {
    let path = path.or_else(HubConfig::default_path);
    let mut config = match &path {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            warn!("No configuration directory; using flags only");
            HubConfig::default()
        }
    };

    for port in servers {
        config.connectors.push(
            ConnectorConfig::server(format!("Server{port}"), port).with_persistent(persistent),
        );
    }
    for (host, port) in clients {
        config.connectors.push(
            ConnectorConfig::client(format!("Client-{host}:{port}"), host, port)
                .with_persistent(persistent),
        );
    }
    if config.connectors.is_empty() {
        bail!("No connectors configured; pass --server or --client, or add them to the config file");
    }

    // Persistent entries are started by the hub, the rest by `drive`
    let hub = ConnectorHub::from_config(&config, registry()).await?;
    info!("Loaded {} connector(s)", hub.len());
    Ok(hub)
}

async fn connect_for_send(host: &str, port: u16, limit: Duration) -> Result<ConnectorSession> {
    let mut session = ConnectorSession::new(
        ConnectorConfig::client("igtlink-send", host, port),
        registry(),
    );
    session.start().await?;

    let deadline = Instant::now() + limit;
    while session.state() != ConnectorState::Connected {
        if session.state() == ConnectorState::Off {
            bail!("Could not connect to {host}:{port}");
        }
        if Instant::now() >= deadline {
            bail!("Timed out connecting to {host}:{port}");
        }
        session.periodic_process().await;
    }
    Ok(session)
}

async fn send(
    host: &str,
    port: u16,
    name: &str,
    xml: Option<&str>,
    parameters: Vec<(String, String)>,
    device: String,
    timeout: Duration,
) -> Result<()> {
    let mut command = Command::new(name)
        .with_device_id(device)
        .with_timeout(timeout);
    if let Some(xml) = xml {
        command
            .set_command_text(xml)
            .context("Invalid command document")?;
    }
    for (key, value) in parameters {
        command.add_parameter(key, value);
    }

    let mut session = connect_for_send(host, port, timeout).await?;
    let done = session.send_command_and_wait(command).await?;
    session.stop();

    println!("{}", done.status());
    if !done.response_text().is_empty() {
        println!("{}", done.response_text());
    }
    if !done.is_succeeded() {
        bail!("Command {name} finished with status {}", done.status());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();

    let interval = Duration::from_millis(cli.interval.max(1));

    match cli.command {
        Commands::Listen { port, session } => {
            let (config, reply) = session.apply(ConnectorConfig::server("Server", port));
            run_single(config, interval, reply.as_deref()).await
        }
        Commands::Connect {
            host,
            port,
            session,
        } => {
            let (config, reply) = session.apply(ConnectorConfig::client("Client", host, port));
            run_single(config, interval, reply.as_deref()).await
        }
        Commands::Run {
            config,
            server,
            client,
            persistent,
            reply,
        } => {
            let hub = run_configured(config, server, client, persistent).await?;
            drive(hub, interval, reply.as_deref()).await
        }
        Commands::Send {
            host,
            port,
            name,
            xml,
            parameters,
            device,
            timeout,
        } => {
            send(
                &host,
                port,
                &name,
                xml.as_deref(),
                parameters,
                device,
                Duration::from_secs(timeout),
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("tracker:18945"), Ok(("tracker".to_string(), 18945)));
        assert_eq!(parse_address("::1:18944"), Ok(("::1".to_string(), 18944)));
        assert!(parse_address("tracker").is_err());
        assert!(parse_address(":18944").is_err());
        assert!(parse_address("tracker:port").is_err());
    }

    #[test]
    fn test_parse_parameter() {
        assert_eq!(
            parse_parameter("Name=Depth"),
            Ok(("Name".to_string(), "Depth".to_string()))
        );
        assert_eq!(
            parse_parameter("Expr=a=b"),
            Ok(("Expr".to_string(), "a=b".to_string()))
        );
        assert!(parse_parameter("Depth").is_err());
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "igtlink",
            "run",
            "--server",
            "18944",
            "--client",
            "localhost:18945",
            "--persistent",
        ])
        .unwrap();
        let Commands::Run {
            server,
            client,
            persistent,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(server, [18944]);
        assert_eq!(client, [("localhost".to_string(), 18945)]);
        assert!(persistent);
    }

    #[test]
    fn test_bare_reply_answers_success() {
        let cli = Cli::try_parse_from(["igtlink", "connect", "--reply"]).unwrap();
        let Commands::Connect { session, .. } = cli.command else {
            panic!("expected connect");
        };
        assert_eq!(session.reply.as_deref(), Some(DEFAULT_REPLY));
    }

    #[test]
    fn test_session_args_apply() {
        let cli = Cli::try_parse_from([
            "igtlink",
            "listen",
            "--port",
            "0",
            "--name",
            "Scanner",
            "--persistent",
            "--reply",
            DEFAULT_REPLY,
        ])
        .unwrap();
        let Commands::Listen { port, session } = cli.command else {
            panic!("expected listen");
        };
        let (config, reply) = session.apply(ConnectorConfig::server("Server", port));
        assert_eq!(config.name, "Scanner");
        assert!(config.persistent);
        assert_eq!(reply.as_deref(), Some(DEFAULT_REPLY));
    }
}
