//! Socketeer service binary.
//!
//! Accepts TCP connections, runs the HELLO/RESUME handshake and the heartbeat
//! on each of them, and keeps sessions resumable across reconnects. Lifecycle
//! events are logged; with `--echo` every application message is sent back
//! to its connection.

use clap::Parser;
use socketeer_session::{EventRecord, OptionValue, Server, ServerEvent, TcpTransport};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ServiceConfig;
use logging::SocketeerLogFormatter;

/// Socketeer connection lifecycle service
#[derive(Parser, Debug)]
#[command(name = "socketeer", version, about = "Connection lifecycle and session resumption service")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:7070
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Ping interval, e.g. 10s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Time allowed for a pong, e.g. 15s
    #[arg(long)]
    heartbeat_timeout: Option<humantime::Duration>,

    /// Time allowed for HELLO or RESUME, e.g. 10s
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,

    /// How long an unbound session stays resumable, e.g. 10s
    #[arg(long)]
    max_session_age: Option<humantime::Duration>,

    /// Keep sessions resumable after their connection drops
    #[arg(long)]
    supports_resuming: bool,

    /// Allow a session to be resumed from a different IP
    #[arg(long)]
    resume_allows_different_ips: bool,

    /// Echo application messages back to their connection
    #[arg(long)]
    echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

impl Args {
    /// Command line flags win over file and environment settings
    fn apply_to(&self, config: &mut ServiceConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        let durations = [
            (self.heartbeat_interval, &mut config.options.heartbeat_interval),
            (self.heartbeat_timeout, &mut config.options.heartbeat_timeout),
            (self.handshake_timeout, &mut config.options.handshake_timeout),
            (self.max_session_age, &mut config.options.max_session_age),
        ];
        for (flag, option) in durations {
            if let Some(value) = flag {
                *option = Some(OptionValue::from(*value));
            }
        }
        if self.supports_resuming {
            config.options.supports_resuming = true;
        }
        if self.resume_allows_different_ips {
            config.options.resume_allows_different_ips = true;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::new("info")
        .add_directive(format!("socketeer={}", args.log_level).parse()?)
        .add_directive(format!("socketeer_session={}", args.log_level).parse()?)
        .add_directive(format!("socketeer_store={}", args.log_level).parse()?)
        .add_directive(format!("socketeer_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(SocketeerLogFormatter::new("socketeer".to_string()))
        .init();

    info!("Starting socketeer v{}", env!("CARGO_PKG_VERSION"));

    let mut service_config = ServiceConfig::load_from_file(&args.config)?;
    args.apply_to(&mut service_config);

    let mut server = Server::new(&service_config.options)?;
    let resolved = server.config();
    info!(
        "Heartbeat every {:?} (timeout {:?}), handshake timeout {:?}, resuming {}",
        resolved.heartbeat_interval,
        resolved.heartbeat_timeout,
        resolved.handshake_timeout,
        if resolved.supports_resuming { "enabled" } else { "disabled" }
    );

    let mut events = server.subscribe();
    let transport = Arc::new(TcpTransport::bind(service_config.listen_addr).await?);
    server.listen(transport.clone())?;
    info!("Listening on {}", transport.local_addr());

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received");
                break;
            }
            received = events.recv() => match received {
                Ok(record) => {
                    log_event(&record);
                    if args.echo {
                        echo(&server, record.event).await;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    component_warn!("events", "Event subscriber lagged, {} events lost", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    server.stop()?;
    info!(
        "Stopped accepting; {} connections and {} sessions remain",
        server.connection_count(),
        server.session_count()
    );
    Ok(())
}

async fn echo(server: &Server, event: ServerEvent) {
    if let ServerEvent::MessageReceived {
        connection_id,
        payload,
        ..
    } = event
    {
        if let Err(e) = server.send(connection_id, payload).await {
            warn!(connection_id = %connection_id, "Echo failed: {}", e);
        }
    }
}

fn log_event(record: &EventRecord) {
    let seq = record.sequence;
    match &record.event {
        ServerEvent::ConnectionAccepted {
            connection_id,
            remote_addr,
        } => component_debug!(
            "events",
            seq,
            connection_id = %connection_id,
            peer = %remote_addr,
            "Connection accepted"
        ),
        ServerEvent::SessionCreated {
            connection_id,
            session_id,
        } => component_info!(
            "events",
            seq,
            connection_id = %connection_id,
            session_id = %session_id,
            "Session created"
        ),
        ServerEvent::SessionResumed {
            connection_id,
            session_id,
            ..
        } => component_info!(
            "events",
            seq,
            connection_id = %connection_id,
            session_id = %session_id,
            "Session resumed"
        ),
        ServerEvent::HandshakeRejected {
            connection_id,
            reason,
        } => component_warn!(
            "events",
            seq,
            connection_id = %connection_id,
            "Handshake rejected: {}",
            reason
        ),
        ServerEvent::HeartbeatTimeout { connection_id, .. } => component_warn!(
            "events",
            seq,
            connection_id = %connection_id,
            "Heartbeat timeout"
        ),
        ServerEvent::ConnectionClosed {
            connection_id,
            cause,
            session_resumable,
            ..
        } => component_info!(
            "events",
            seq,
            connection_id = %connection_id,
            resumable = session_resumable,
            "Connection closed: {}",
            cause
        ),
        ServerEvent::StoreError {
            connection_id,
            error,
        } => component_warn!(
            "events",
            seq,
            connection_id = ?connection_id,
            "Store error: {}",
            error
        ),
        ServerEvent::TransportError {
            connection_id,
            message,
        } => component_warn!(
            "events",
            seq,
            connection_id = ?connection_id,
            "Transport error: {}",
            message
        ),
        other => component_debug!(
            "events",
            seq,
            connection_id = ?other.connection_id(),
            "{}",
            other.name()
        ),
    }
}
