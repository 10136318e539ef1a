use std::sync::Arc;

use log::debug;
use tokio::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::rate_counter::RateCounter;
use crate::tunnel::BidirectionalTunnel;
use crate::tunnel_supervisor::TunnelSupervisor;

// One load-balancer target: its endpoint, its counters, and (when a
// jump host is configured) the supervisor keeping it reachable.
pub struct Upstream {
    pub endpoint: Endpoint,
    pub byte_rate: RateCounter,
    pub opened: RateCounter,
    pub closed: RateCounter,
    pub failed: RateCounter,
    tunnel_supervisor: Option<TunnelSupervisor>,
}

impl Upstream {
    pub fn new(endpoint: Endpoint, tunnel_supervisor: Option<TunnelSupervisor>) -> Self {
        let name = endpoint.to_string();
        Self {
            endpoint,
            byte_rate: RateCounter::new(format!("{name}:bytes")),
            opened: RateCounter::new(format!("{name}:opened")),
            closed: RateCounter::new(format!("{name}:closed")),
            failed: RateCounter::new(format!("{name}:failed")),
            tunnel_supervisor,
        }
    }

    // Starts this upstream's tunnel supervisor, if it has one. Called
    // once at process startup, not per connection.
    pub fn activate(&self) {
        if let Some(sup) = &self.tunnel_supervisor {
            sup.start();
        }
    }

    // Opens a fresh TCP connection to endpoint and hands the pair off to
    // a bidirectional tunnel. Returns once the tunnel's two half-tunnel
    // tasks are spawned, not once data has flowed. On failure the client
    // socket is handed back untouched, so the caller can increment
    // failed and retry against a different upstream.
    pub async fn establish_tunnel(
        self: Arc<Self>,
        client: TcpStream,
    ) -> Result<(), (std::io::Error, TcpStream)> {
        match TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port as u16)).await {
            Ok(upstream_sock) => {
                debug!("connected to upstream {}", self.endpoint);
                BidirectionalTunnel::spawn(client, upstream_sock, self);
                Ok(())
            }
            Err(e) => Err((e, client)),
        }
    }

    pub fn increment_failed_conn(&self) {
        self.failed.increment_by(1);
    }

    pub fn increment_opened_conn(&self) {
        self.opened.increment_by(1);
    }

    pub fn increment_closed_conn(&self) {
        self.closed.increment_by(1);
    }

    pub fn increment_byte_rate_by(&self, n: u64) {
        self.byte_rate.increment_by(n);
    }

    // Healthy if this upstream has never opened a connection, or it has
    // had no connect failures in the last minute.
    pub fn is_healthy(&self) -> bool {
        self.opened.total_count() == 0 || self.failed.last_minute_count() == 0
    }

    // Terminates the tunnel supervisor, if any. Calling it again after
    // the supervisor has already stopped is a no-op because
    // TunnelSupervisor::shutdown itself is idempotent.
    pub async fn close(&self) {
        if let Some(sup) = &self.tunnel_supervisor {
            sup.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_used_upstream_is_healthy() {
        let up = Upstream::new(Endpoint::new("localhost", 1), None);
        assert!(up.is_healthy());
    }

    #[test]
    fn unhealthy_after_recent_failure_once_used() {
        let up = Upstream::new(Endpoint::new("localhost", 1), None);
        up.increment_opened_conn();
        up.increment_failed_conn();
        assert!(!up.is_healthy());
    }

    #[test]
    fn healthy_again_once_used_with_no_recent_failures() {
        let up = Upstream::new(Endpoint::new("localhost", 1), None);
        up.increment_opened_conn();
        assert!(up.is_healthy());
    }

    #[tokio::test]
    async fn close_without_supervisor_is_a_noop() {
        let up = Upstream::new(Endpoint::new("localhost", 1), None);
        up.close().await;
        up.close().await;
    }
}
