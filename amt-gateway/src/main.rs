use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "amt-gateway")]
#[command(about = "Pull a source-specific multicast stream through an AMT relay onto a local UDP port")]
struct Args {
    /// Relay name from the catalogue, host name or IPv4 address
    relay: String,

    /// Multicast source address
    source: Ipv4Addr,

    /// Multicast group address
    group: Ipv4Addr,

    /// Local port of the AMT socket
    amt_port: u16,

    /// Loopback port decapsulated payload is sent to
    udp_port: u16,

    /// TOML file with the tunnel configuration
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = tracing_subscriber::filter::LevelFilter::INFO)]
    verbosity: tracing_subscriber::filter::LevelFilter,
}

fn main() -> anyhow::Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(
            e.kind(),
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
        ) =>
        {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(args.verbosity);
    let tokio_console_layer = console_subscriber::spawn();

    tracing_subscriber::registry()
        .with(tokio_console_layer)
        .with(stdout_layer)
        .init();

    rt.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config: mcast_config::TunnelConfig = match &args.config {
        Some(path) => mcast_config::load(path)?,
        None => Default::default(),
    };

    tracing::info!(
        "Starting AMT tunnel - Relay: {}, Source: {}, Multicast: {}, AMT Port: {}, UDP Port: {}",
        args.relay,
        args.source,
        args.group,
        args.amt_port,
        args.udp_port
    );

    let pool = amt_gateway::RelayPool::resolve(&args.relay, &config.relays).await?;
    // Spread gateways over the pool instead of all starting at its first relay
    let start = rand::random_range(0..pool.len());
    let pool = pool.starting_at(start);

    let stream = amt_gateway::Stream {
        source: args.source,
        group: args.group,
        amt_port: args.amt_port,
        udp_port: args.udp_port,
    };

    let (stop_notifier, stop) = tokio::sync::watch::channel(false);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::task::Builder::new().name("signal handler").spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, tearing down tunnel");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, tearing down tunnel");
            }
        }

        stop_notifier.send_replace(true);
    })?;

    amt_gateway::Tunnel::new(config, stream, pool, stop).run().await?;

    tracing::info!("Exiting AMT tunnel");
    Ok(())
}
