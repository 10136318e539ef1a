use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::load_balancer::LoadBalancer;
use crate::upstream::Upstream;

const RETRY_MAX: u32 = 3;

// Accepts client connections on the listening port and hands each one
// off to an upstream picked by the load balancer, retrying against a
// freshly-picked upstream up to RETRY_MAX times on connect failure.
pub struct Dispatcher {
    listener: TcpListener,
    load_balancer: Box<dyn LoadBalancer>,
    shutdown: Arc<Notify>,
}

impl Dispatcher {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs, load_balancer: Box<dyn LoadBalancer>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            load_balancer,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    // Runs the accept loop until shutdown_handle().notify_one() is
    // called. Accept errors are logged and the loop continues; only the
    // shutdown signal breaks it.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => {
                            info!("accepted connection from {}", peer);
                            self.setup_tunnel(client).await;
                        }
                        Err(e) => {
                            warn!("accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("dispatcher shutting down, no longer accepting connections");
                    break;
                }
            }
        }
    }

    // Bounded retry: up to RETRY_MAX attempts, each against a freshly
    // selected upstream. On exhaustion the client socket is dropped
    // explicitly rather than left to leak.
    async fn setup_tunnel(&self, client: TcpStream) {
        let mut client = client;
        for attempt in 1..=RETRY_MAX {
            let upstream: Arc<Upstream> = self.load_balancer.pick_upstream();
            match Arc::clone(&upstream).establish_tunnel(client).await {
                Ok(()) => return,
                Err((e, returned_client)) => {
                    warn!(
                        "attempt {}/{} to {} failed: {}",
                        attempt, RETRY_MAX, upstream.endpoint, e
                    );
                    upstream.increment_failed_conn();
                    client = returned_client;
                }
            }
        }
        error!("exhausted {} retries, dropping client connection", RETRY_MAX);
        drop(client);
    }
}
