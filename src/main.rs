use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use tailcast_resolver::{ChainResolver, LogPathResolver, Pm2Resolver};
use tailcast_server::Broadcaster;
use tailcast_tail::FileTailTracker;

mod config;

use config::Config;

/// Time connections get to deliver their close frame on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Tailcast - Stream pm2 process logs to WebSocket clients as they are written
#[derive(Parser, Debug)]
#[command(name = "tailcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ~/.tailcast/config.toml when present)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Request path accepted for WebSocket upgrades
    #[arg(long)]
    endpoint: Option<String>,

    /// Milliseconds to coalesce change notifications before reading
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// pm2 executable used to look up process log files
    #[arg(long, value_name = "PATH")]
    pm2_bin: Option<PathBuf>,

    /// Only serve processes listed in the config file
    #[arg(long)]
    static_only: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(endpoint) = &self.endpoint {
            config.server.endpoint = endpoint.clone();
        }
        if let Some(debounce_ms) = self.debounce_ms {
            config.tail.debounce_ms = debounce_ms;
        }
        if let Some(pm2_bin) = &self.pm2_bin {
            config.resolver.pm2_bin = pm2_bin.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let resolver = build_resolver(&config, args.static_only);
    let tracker = FileTailTracker::new(config.tail_config());
    let broadcaster = Broadcaster::new(tracker.clone(), resolver, config.server_config());

    let listener = Broadcaster::bind(config.bind_address()).await?;
    let server = {
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move { broadcaster.serve(listener).await })
    };

    shutdown_signal().await?;
    tracing::info!("Shutdown requested");

    broadcaster.shutdown_all();
    server.await??;
    broadcaster.wait_closed(SHUTDOWN_GRACE).await;
    tracker.stop_all_watches();

    Ok(())
}

/// Static table first, then pm2 unless disabled
fn build_resolver(config: &Config, static_only: bool) -> Arc<dyn LogPathResolver> {
    let table = config.static_resolver();
    tracing::debug!(processes = table.len(), static_only, "Log path resolvers configured");

    if static_only {
        return Arc::new(table);
    }
    Arc::new(
        ChainResolver::new()
            .with(table)
            .with(Pm2Resolver::new(config.resolver.pm2_bin.clone())),
    )
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
