//! Entrypoint of the fluxgate binary: a sharding and high-availability
//! proxy in front of a fleet of InfluxDB-compatible nodes.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clap::Parser;
use hyper::{server::conn::Http, service::service_fn};
use proxy::Proxy;
use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transfer::Transfer;

mod config;
mod http;
mod tls;

use config::FileConfig;
use http::HttpService;

#[derive(Debug, Parser)]
#[clap(
    name = "fluxgate",
    version,
    about = "Sharding and high-availability proxy for InfluxDB"
)]
struct Config {
    /// Path to the TOML or JSON configuration file.
    #[clap(long = "config", default_value = "fluxgate.toml", action)]
    config_path: PathBuf,

    /// Log filter directive (e.g. `info` or `debug,hyper=info`); overrides
    /// the config file.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    log_filter: Option<String>,
}

fn main() {
    let config = Config::parse();

    let file_config = match FileConfig::from_path(&config.config_path) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("unable to load config: {e}");
            std::process::exit(1);
        }
    };

    let filter = config
        .log_filter
        .clone()
        .unwrap_or_else(|| file_config.log_filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("unable to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config, file_config)) {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

async fn serve(
    config: Config,
    file_config: Arc<FileConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    let proxy = Arc::new(Proxy::open(&file_config.proxy).await?);
    let transfer = Transfer::new(proxy.circles());
    let service = HttpService::new(
        Arc::clone(&proxy),
        Arc::clone(&transfer),
        Arc::clone(&file_config),
        config.config_path.clone(),
    );

    let tls_acceptor = if !file_config.tls_cert.is_empty() && !file_config.tls_key.is_empty() {
        Some(tls::acceptor(&file_config.tls_cert, &file_config.tls_key)?)
    } else {
        None
    };

    let listener = TcpListener::bind(&file_config.listen_addr).await?;
    info!(
        addr = %file_config.listen_addr,
        https = tls_acceptor.is_some(),
        circles = file_config.proxy.circles.len(),
        "fluxgate listening"
    );

    let idle_timeout = Duration::from_secs(file_config.idle_timeout);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => break,
        };

        let service = Arc::clone(&service);
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            let handler = service_fn(move |req| {
                let service = Arc::clone(&service);
                async move { Ok::<_, Infallible>(service.route(req).await) }
            });

            let mut http = Http::new();
            http.http1_keep_alive(true)
                .http1_header_read_timeout(idle_timeout);

            let served = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => http.serve_connection(tls_stream, handler).await,
                    Err(e) => {
                        warn!(%peer, error = %e, "tls handshake failed");
                        return;
                    }
                },
                None => http.serve_connection(stream, handler).await,
            };
            if let Err(e) = served {
                warn!(%peer, error = %e, "connection error");
            }
        });
    }

    info!("shutting down, draining backends");
    proxy.close().await;
    Ok(())
}
