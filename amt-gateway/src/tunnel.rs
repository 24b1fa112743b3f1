use std::net::SocketAddrV4;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::gate::LocalGate;
use crate::relay::RelayPool;
use crate::session::{AmtSession, SessionState, log_transition};
use crate::{Stream, TunnelError};

/// How long to wait before the next attempt after `failures` consecutive failed handshakes
pub fn reconnect_delay(backoff: &mcast_config::BackoffConfig, failures: u32) -> Duration {
    match backoff {
        mcast_config::BackoffConfig::Fixed { delay } => *delay,
        mcast_config::BackoffConfig::Exponential {
            initial_delay,
            max_delay,
            jitter,
        } => {
            let exponent = failures.saturating_sub(1).min(31);
            let base = initial_delay.saturating_mul(1 << exponent).min(*max_delay);

            let jitter = jitter.min(1.0);
            if jitter.is_nan() || jitter <= 0.0 {
                return base;
            }
            let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
            base.mul_f64(factor).min(*max_delay)
        }
    }
}

/// Keeps one stream flowing from whichever relay of the pool answers, until stopped
pub struct Tunnel {
    config: mcast_config::TunnelConfig,
    stream: Stream,
    pool: RelayPool,
    stop: watch::Receiver<bool>,
}

impl Tunnel {
    pub fn new(
        config: mcast_config::TunnelConfig,
        stream: Stream,
        pool: RelayPool,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Tunnel {
            config,
            stream,
            pool,
            stop,
        }
    }

    /// Returns `Ok` once stopped. Spending the reconnect budget is an error only if no relay
    /// ever got as far as relaying; afterwards the tunnel keeps cycling through the pool.
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let gate = LocalGate::new(self.config.local_loopback, self.stream.udp_port)?;
        let max_attempts = self.config.max_reconnect_attempts.max(1);
        let mut failures: u32 = 0;
        let mut relayed = false;

        loop {
            let relay_ip = self.pool.current();
            let established = tokio::select! {
                biased;
                _ = self.stop.wait_for(|stopped| *stopped) => {
                    tracing::info!("Stopped before a tunnel was established");
                    return Ok(());
                }
                established = AmtSession::establish(relay_ip, self.stream, &self.config) => established,
            };

            let mut session = match established {
                Ok(session) => session,
                Err(e) => {
                    failures += 1;
                    tracing::event!(
                        tracing::Level::WARN,
                        relay = %relay_ip,
                        attempt = failures,
                        max_attempts,
                        error = %e,
                        "HANDSHAKE_FAILED"
                    );
                    let next = self.pool.rotate();

                    if failures >= max_attempts {
                        if !relayed {
                            log_transition(
                                SocketAddrV4::new(relay_ip, self.config.relay_port),
                                SessionState::Reconnecting,
                                SessionState::Terminated,
                            );
                            tracing::error!("Failed to reconnect after {} attempts. Exiting.", failures);
                            return Err(TunnelError::BudgetExhausted(failures));
                        }
                        tracing::warn!(
                            "No relay of {} answered in {} attempts, starting over",
                            self.pool.name(),
                            failures
                        );
                        failures = 0;
                    }

                    tracing::info!("Trying relay {} of {} next", next, self.pool.name());
                    if !self.pause(failures.max(1)).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            tracing::info!("AMT tunnel established with relay {}", session.relay_addr());

            let relaying = session.relay(&gate, &mut self.stop).await;
            relayed = true;
            match relaying {
                Ok(()) => {
                    session.teardown().await;
                    tracing::info!(
                        "Exiting AMT tunnel after forwarding {} packets",
                        session.packets()
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!("AMT tunnel error: {}. Attempting to reconnect.", e);
                    session.transition(SessionState::Reconnecting);

                    // The tunnel did work, so this relay starts a fresh budget
                    failures = 0;
                    let next = self.pool.rotate();
                    tracing::info!("Reconnecting via relay {} of {}", next, self.pool.name());

                    if !self.pause(1).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    // False if stopped while waiting
    async fn pause(&mut self, failures: u32) -> bool {
        let delay = reconnect_delay(&self.config.reconnect_backoff, failures);
        tokio::select! {
            biased;
            _ = self.stop.wait_for(|stopped| *stopped) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_relay::FakeRelay;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    fn stream(udp_port: u16) -> Stream {
        Stream {
            source: Ipv4Addr::new(198, 51, 100, 7),
            group: Ipv4Addr::new(232, 1, 1, 1),
            amt_port: 0,
            udp_port,
        }
    }

    #[test]
    fn fixed_backoff_ignores_failure_count() {
        let backoff = mcast_config::BackoffConfig::default();
        assert_eq!(reconnect_delay(&backoff, 1), Duration::from_secs(5));
        assert_eq!(reconnect_delay(&backoff, 4), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_doubles_up_to_cap() {
        let backoff = mcast_config::BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(reconnect_delay(&backoff, 1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(&backoff, 2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(&backoff, 4), Duration::from_secs(8));
        assert_eq!(reconnect_delay(&backoff, 5), Duration::from_secs(10));
        assert_eq!(reconnect_delay(&backoff, 40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = mcast_config::BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = reconnect_delay(&backoff, 1);
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(6), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_fatal() {
        // Two relays that never answer
        let silent_a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent_a.local_addr().unwrap().port();
        let silent_b = tokio::net::UdpSocket::bind(("127.0.0.2", port)).await.unwrap();

        let config = mcast_config::TunnelConfig {
            relay_port: port,
            max_reconnect_attempts: 3,
            join_local_group: false,
            ..Default::default()
        };
        let pool = RelayPool::new("silent", vec![Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(127, 0, 0, 2)]).unwrap();
        let (_stop_tx, stop) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let result = Tunnel::new(config, stream(9), pool, stop).run().await;
        assert!(matches!(result, Err(TunnelError::BudgetExhausted(3))), "{result:?}");
        // Three 60s handshake timeouts with a 5s pause between attempts, none after the last
        assert_eq!(started.elapsed(), Duration::from_secs(3 * 60 + 2 * 5));

        // Both relays of the pool were tried
        for silent in [&silent_a, &silent_b] {
            let mut buf = [0u8; 64];
            let size = tokio::time::timeout(Duration::from_secs(1), silent.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf[0], 0x01, "{:?}", &buf[..size]);
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handshakes_log_state_changes() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let log = log.clone();
                move || log.clone()
            })
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = mcast_config::TunnelConfig {
            relay_port: silent.local_addr().unwrap().port(),
            max_reconnect_attempts: 1,
            join_local_group: false,
            ..Default::default()
        };
        let pool = RelayPool::new("silent", vec![Ipv4Addr::LOCALHOST]).unwrap();
        let (_stop_tx, stop) = watch::channel(false);

        let result = Tunnel::new(config, stream(9), pool, stop).run().await;
        assert!(matches!(result, Err(TunnelError::BudgetExhausted(1))), "{result:?}");

        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("from=DISCOVERING to=RECONNECTING"), "{output}");
        assert!(output.contains("from=RECONNECTING to=TERMINATED"), "{output}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_pause() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = mcast_config::TunnelConfig {
            relay_port: silent.local_addr().unwrap().port(),
            socket_timeout: Duration::from_secs(1),
            reconnect_backoff: mcast_config::BackoffConfig::Fixed {
                delay: Duration::from_secs(3600),
            },
            join_local_group: false,
            ..Default::default()
        };
        let pool = RelayPool::new("silent", vec![Ipv4Addr::LOCALHOST]).unwrap();
        let (stop_tx, stop) = watch::channel(false);

        let tunnel = tokio::spawn(Tunnel::new(config, stream(9), pool, stop).run());
        tokio::time::sleep(Duration::from_secs(10)).await;
        stop_tx.send_replace(true);

        tunnel.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn relay_failure_restarts_then_stop_tears_down() {
        let mut relay = FakeRelay::spawn().await;
        let consumer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = consumer.local_addr().unwrap().port();

        let config = mcast_config::TunnelConfig {
            relay_port: relay.port(),
            socket_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 1,
            reconnect_backoff: mcast_config::BackoffConfig::Fixed {
                delay: Duration::from_millis(10),
            },
            join_local_group: false,
            ..Default::default()
        };
        let pool = RelayPool::new("fake", vec![Ipv4Addr::LOCALHOST]).unwrap();
        let (stop_tx, stop) = watch::channel(false);
        let tunnel = tokio::spawn(Tunnel::new(config, stream(udp_port), pool, stop).run());

        // Break the first tunnel once it is up
        let (_, first_gateway) = relay.next_update().await;
        relay.send_raw(first_gateway, &[0x06, 0x00, 0x45]).await;

        // A budget of one would be fatal if the failure counted against it
        let (_, second_gateway) = relay.next_update().await;
        assert_eq!(relay.discoveries(), 2);

        relay.send_data(second_gateway, b"after failover").await;
        let mut buf = [0u8; 64];
        let size = tokio::time::timeout(Duration::from_secs(2), consumer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..size], b"after failover");

        stop_tx.send_replace(true);
        let teardown = relay.next_teardown().await;
        assert_eq!(teardown.gateway, second_gateway);
        tunnel.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn relayed_tunnel_outlives_the_budget() {
        let mut relay = FakeRelay::spawn().await;
        let consumer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = consumer.local_addr().unwrap().port();

        let config = mcast_config::TunnelConfig {
            relay_port: relay.port(),
            socket_timeout: Duration::from_millis(200),
            max_reconnect_attempts: 2,
            reconnect_backoff: mcast_config::BackoffConfig::Fixed {
                delay: Duration::from_millis(10),
            },
            join_local_group: false,
            ..Default::default()
        };
        let pool = RelayPool::new("fake", vec![Ipv4Addr::LOCALHOST]).unwrap();
        let (stop_tx, stop) = watch::channel(false);
        let tunnel = tokio::spawn(Tunnel::new(config, stream(udp_port), pool, stop).run());

        let (_, gateway) = relay.next_update().await;
        relay.send_data(gateway, b"relayed once").await;
        let mut buf = [0u8; 64];
        let size = tokio::time::timeout(Duration::from_secs(2), consumer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..size], b"relayed once");

        // Break the tunnel, then leave every later handshake unanswered
        relay.send_raw(gateway, &[0x06, 0x00, 0x45]).await;
        drop(relay);

        // Long enough to spend the budget of two attempts several times over
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!tunnel.is_finished());

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), tunnel)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
