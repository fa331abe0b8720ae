use clap::Parser;
use conduit::{
    Engine, EngineConfig, EndpointConfig, FramingKind, Result, SendFlags, TlsSettings,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "A multi-threaded TCP/TLS connection engine")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value = "6200")]
    port: u16,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// I/O worker threads (0 = number of cores)
    #[arg(short, long, default_value = "0")]
    workers: usize,

    /// Busy-poll worker queues instead of blocking
    #[arg(long)]
    low_latency: bool,

    /// Framing on the main endpoint (detect, var_len, fixed_len, mux, line, raw)
    #[arg(long, default_value = "detect")]
    framing: String,

    /// Process-wide cap on concurrent inbound connections
    #[arg(long, default_value = "50000")]
    max_connections: usize,

    /// TLS certificate file path (PEM format)
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key file path (PEM format)
    #[arg(long)]
    tls_key: Option<String>,

    /// Echo received frames back to the sender
    #[arg(long)]
    echo: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    info!("Starting conduit on {}:{}", args.host, args.port);

    let framing = match args.framing.as_str() {
        "detect" => FramingKind::Detect,
        "var_len" => FramingKind::VarLen,
        "fixed_len" => FramingKind::FixedLen,
        "mux" => FramingKind::Mux,
        "line" => FramingKind::Line,
        "raw" => FramingKind::Raw,
        other => {
            return Err(conduit::EngineError::Config(format!(
                "unknown framing: {other}"
            )))
        }
    };

    let mut endpoint =
        EndpointConfig::new("main", &args.host, args.port).with_framing(framing);
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            info!("TLS certificate: {cert}");
            endpoint = endpoint.with_tls(TlsSettings::new(cert.clone(), key.clone()));
        }
        (None, None) => {}
        _ => {
            return Err(conduit::EngineError::Config(
                "TLS needs both --tls-cert and --tls-key".to_string(),
            ))
        }
    }

    // Environment variables (CONDUIT_*) fill in everything the CLI
    // does not cover.
    let mut config = EngineConfig::from_env().unwrap_or_default();
    config.workers = args.workers;
    config.low_latency = args.low_latency;
    config.max_incoming_connections = args.max_connections;
    config = config.with_endpoint(endpoint);

    let engine = std::sync::Arc::new(Engine::new(config)?);

    if args.echo {
        let echo_engine = engine.clone();
        engine.on_receive(move |ctx, payload, command| {
            let flags = SendFlags {
                command,
                stream: ctx.stream,
            };
            if let Err(e) = echo_engine.send(ctx.id, &payload, flags) {
                warn!(conn = %ctx.id, error = %e, "echo failed");
            }
        });
    } else {
        engine.on_receive(|ctx, payload, command| {
            info!(
                conn = %ctx.id,
                bytes = payload.len(),
                command,
                "frame received"
            );
        });
    }
    engine.on_closed(|ctx, reason| {
        info!(conn = %ctx.id, %reason, "closed");
    });

    engine.start_transport()?;
    engine.start_messaging();

    // Run until killed, logging counters once a minute.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        for (endpoint, snapshot) in engine.metrics() {
            info!(
                %endpoint,
                active = snapshot.active_connections,
                total = snapshot.total_connections,
                msgs_in = snapshot.messages_in,
                msgs_out = snapshot.messages_out,
                bad = snapshot.bad_connections,
                "endpoint stats"
            );
        }
    }
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
