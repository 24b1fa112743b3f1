use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut translator = mcast_config::TranslatorConfig::default();
    translator.unicast.listen_ip = Some(std::net::Ipv4Addr::new(192, 0, 2, 10));
    translator.allocation.idle_timeout = Some(Duration::from_secs(600));
    translator.registration.contact = "streams@example.net".to_string();

    let mut tunnel = mcast_config::TunnelConfig::default();
    tunnel.reconnect_backoff = mcast_config::BackoffConfig::Exponential {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        jitter: 0.2,
    };

    println!("# mcast-translator --config <file>");
    println!("{}", toml::to_string(&translator)?);
    println!("# amt-gateway --config <file>");
    println!("{}", toml::to_string(&tunnel)?);

    Ok(())
}
