mod config;
mod dispatcher;
mod endpoint;
mod load_balancer;
mod rate_counter;
mod security;
#[cfg(feature = "status")]
mod status;
mod tunnel;
mod tunnel_supervisor;
mod upstream;

use std::sync::Arc;

use clap::Parser;
use clap::error::ErrorKind;
use log::info;

use config::{Args, ProxyConfig};
use endpoint::Endpoint;
use tunnel_supervisor::TunnelSupervisor;
use upstream::Upstream;

// Falls back to "unknown" only if the macro somehow expands to an empty string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn version_or_unknown() -> &'static str {
    if VERSION.is_empty() {
        "unknown"
    } else {
        VERSION
    }
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            e.exit();
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let verbose = args.verbose;
    let config = match ProxyConfig::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    info!("starting tcp-lb-proxy v{}", version_or_unknown());
    info!(
        "listening on {}, status on {}, {} upstream(s), load balancer {:?}",
        config.listen_port,
        config.status_port,
        config.upstreams.len(),
        config.load_balancer
    );

    let jump_host = config.jump_host.clone().map(Arc::new);

    let upstreams: Arc<Vec<Arc<Upstream>>> = Arc::new(
        config
            .upstreams
            .iter()
            .cloned()
            .map(|endpoint: Endpoint| {
                let supervisor = jump_host.as_ref().map(|jh| {
                    TunnelSupervisor::new(Arc::clone(jh), endpoint.port as u16)
                });
                Arc::new(Upstream::new(endpoint, supervisor))
            })
            .collect(),
    );

    for up in upstreams.iter() {
        up.activate();
    }

    let load_balancer = load_balancer::build(config.load_balancer, Arc::clone(&upstreams));

    let dispatcher = match dispatcher::Dispatcher::bind(
        ("0.0.0.0", config.listen_port),
        load_balancer,
    )
    .await
    {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error: failed to bind listen port {}: {}", config.listen_port, e);
            std::process::exit(1);
        }
    };
    let shutdown = dispatcher.shutdown_handle();

    let status_upstreams = Arc::clone(&upstreams);
    let status_port = config.status_port;
    tokio::spawn(start_status_server(status_upstreams, status_port));

    let mut dispatcher_task = tokio::spawn(async move { dispatcher.run().await });

    tokio::select! {
        res = &mut dispatcher_task => {
            let _ = res;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            shutdown.notify_one();
            let _ = dispatcher_task.await;
        }
    }

    for up in upstreams.iter() {
        up.close().await;
    }
    info!("clean shutdown completed");
}

#[cfg(feature = "status")]
async fn start_status_server(upstreams: Arc<Vec<Arc<Upstream>>>, port: u16) {
    status::serve(upstreams, port).await;
}

#[cfg(not(feature = "status"))]
async fn start_status_server(_upstreams: Arc<Vec<Arc<Upstream>>>, _port: u16) {
    log::warn!("status feature not enabled, skipping status server");
}
