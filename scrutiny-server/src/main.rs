use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use log::{error, info, warn};

use scrutiny_server::config::{Config, LinkConfig};
use scrutiny_server::DeviceHandler;

#[derive(Parser, Debug)]
#[command(name = "scrutiny-server")]
#[command(about = "Scrutiny embedded debugger: device-facing core")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured link: "none", "tcp:HOST:PORT" or "udp:HOST:PORT"
    #[arg(long, value_name = "SPEC")]
    link: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn parse_link_override(spec: &str) -> anyhow::Result<LinkConfig> {
    if spec == "none" {
        return Ok(LinkConfig::None);
    }
    let (kind, rest) = spec.split_once(':').ok_or_else(|| anyhow::anyhow!("malformed --link spec: {spec}"))?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(|| anyhow::anyhow!("malformed --link spec: {spec}"))?;
    let port: u16 = port.parse().map_err(|_| anyhow::anyhow!("invalid port in --link spec: {spec}"))?;
    match kind {
        "tcp" => Ok(LinkConfig::Tcp { host: host.to_string(), port }),
        "udp" => Ok(LinkConfig::Udp { host: host.to_string(), port }),
        other => anyhow::bail!("unsupported --link kind: {other}"),
    }
}

fn init_logging(args: &Args) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }
    let level = if args.quiet {
        log::LevelFilter::Warn
    } else {
        match args.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::new().filter_level(level).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(spec) = &args.link {
        config.link = parse_link_override(spec)?;
    }

    info!("scrutiny-server starting, tick interval {:?}", config.device.tick_interval());

    let mut handler = DeviceHandler::new(&config)?;
    let tick_interval = config.device.tick_interval();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut was_ready = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                handler.process(Instant::now());
                let is_ready = handler.is_ready();
                if is_ready && !was_ready {
                    info!("device session ready, server_session_id={:?}", handler.server_session_id());
                } else if !is_ready && was_ready {
                    warn!("device session lost");
                }
                was_ready = is_ready;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("failed to listen for shutdown signal: {e}");
                }
                break;
            }
            _ = wait_for_sigterm() => {
                break;
            }
        }
    }

    info!("scrutiny-server shutting down");
    handler.request_disconnect();
    let shutdown_deadline = Instant::now() + std::time::Duration::from_secs(2);
    while Instant::now() < shutdown_deadline {
        handler.process(Instant::now());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
