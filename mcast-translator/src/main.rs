use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "mcast-translator")]
#[command(about = "Republish unicast UDP streams on private multicast groups")]
struct Args {
    /// Address to receive unicast on [default: address of the interface with the default route]
    #[arg(long)]
    unicast_nif_ip: Option<Ipv4Addr>,

    /// [default: 9001]
    #[arg(long)]
    unicast_port: Option<u16>,

    /// CIDR block multicast groups are allocated from [default: 232.0.0.0/8]
    #[arg(long)]
    multicast_addr_space: Option<mcast_config::AddressSpace>,

    /// Destination port shared by every group [default: 9002]
    #[arg(long)]
    multicast_port: Option<u16>,

    /// TOML file with the full translator configuration; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not announce new streams to the directory
    #[arg(long)]
    no_registration: bool,

    /// Contact address submitted with every announced stream
    #[arg(long)]
    contact: Option<String>,

    #[arg(short, long, default_value_t = tracing_subscriber::filter::LevelFilter::INFO)]
    verbosity: tracing_subscriber::filter::LevelFilter,
}

impl Args {
    fn translator_config(&self) -> anyhow::Result<mcast_config::TranslatorConfig> {
        let mut config: mcast_config::TranslatorConfig = match &self.config {
            Some(path) => mcast_config::load(path)?,
            None => Default::default(),
        };

        if let Some(ip) = self.unicast_nif_ip {
            config.unicast.listen_ip = Some(ip);
        }
        if let Some(port) = self.unicast_port {
            config.unicast.port = port;
        }
        if let Some(address_space) = self.multicast_addr_space {
            config.multicast.address_space = address_space;
        }
        if let Some(port) = self.multicast_port {
            config.multicast.port = port;
        }
        if self.no_registration {
            config.registration.enabled = false;
        }
        if let Some(contact) = &self.contact {
            config.registration.contact = contact.clone();
        }

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
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
    let config = args.translator_config()?;
    let shutdown_grace = config.unicast.read_timeout + config.registration.request_timeout;

    let translator = mcast_translator::Translator::new(config)?;
    tracing::info!("Multicast source address: {}", translator.source_ip());
    translator.start()?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }

    if translator.terminate(true, Some(shutdown_grace)).await {
        tracing::info!("Graceful shutdown complete");
    } else {
        tracing::warn!("Translator did not stop within {:?}", shutdown_grace);
    }

    Ok(())
}
