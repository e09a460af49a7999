//! Crossbar CLI entry point.
//!
//! Operational surface for the messaging fabric: run a broker, run a demo
//! echo worker, fire one-shot requests, and query the built-in `mmi.*`
//! introspection services.

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crossbar::auth::{BearerGuard, RateLimiter, RbacEvaluator, TokenBlacklist, TokenManager};
use crossbar::broker::cluster::{BrokerNode, ClusterView};
use crossbar::broker::Broker;
use crossbar::config::Config;
use crossbar::endpoint::{Client, Worker};
use crossbar::transport::tcp::{TcpConnector, TcpRouterSocket};

#[derive(Parser)]
#[command(name = "crossbar", version, about = "Service-oriented messaging fabric")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a broker on the configured endpoint.
    Broker {
        /// Bind address (overrides config).
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Run a demo echo worker against a broker.
    Worker {
        /// Service name to register.
        #[arg(long, default_value = "echo")]
        service: String,
        /// Broker address (overrides config).
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Send one request and print the streamed replies.
    Request {
        /// Target service name.
        service: String,
        /// Request payload (sent as one frame).
        payload: String,
        /// Broker address (overrides config).
        #[arg(long)]
        endpoint: Option<String>,
        /// Receive timeout in milliseconds.
        #[arg(long, default_value_t = 2500)]
        timeout_ms: u64,
    },

    /// Query a built-in management service (`mmi.*`).
    Mmi {
        /// Management service name, e.g. `mmi.service`.
        service: String,
        /// Optional argument frame (e.g. the service being asked about).
        arg: Option<String>,
        /// Broker address (overrides config).
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Command::Broker { endpoint } => {
            run_broker(&config, endpoint.unwrap_or_else(|| config.endpoint.clone())).await
        }
        Command::Worker { service, endpoint } => {
            run_echo_worker(endpoint.unwrap_or_else(|| config.endpoint.clone()), &service).await
        }
        Command::Request {
            service,
            payload,
            endpoint,
            timeout_ms,
        } => {
            run_request(
                endpoint.unwrap_or_else(|| config.endpoint.clone()),
                &service,
                vec![Bytes::from(payload)],
                Duration::from_millis(timeout_ms),
            )
            .await
        }
        Command::Mmi {
            service,
            arg,
            endpoint,
        } => {
            let payload: Vec<Bytes> = arg.map(Bytes::from).into_iter().collect();
            run_request(
                endpoint.unwrap_or_else(|| config.endpoint.clone()),
                &service,
                payload,
                Duration::from_millis(2500),
            )
            .await
        }
    }
}

async fn run_broker(config: &Config, endpoint: String) -> Result<()> {
    let socket = TcpRouterSocket::bind(&endpoint)
        .await
        .with_context(|| format!("binding broker at {endpoint}"))?;

    let cancel = CancellationToken::new();
    let cluster = Arc::new(ClusterView::new(BrokerNode::new(
        config.node_id.clone(),
        endpoint.clone(),
    )));
    let detector = cluster.spawn_failure_detector(cancel.clone());

    let mut broker = Broker::new(Box::new(socket)).with_cluster(Arc::clone(&cluster));
    if config.has_token_secrets() {
        let blacklist = Arc::new(TokenBlacklist::new());
        let tokens = Arc::new(TokenManager::new(config.token_config(), blacklist)?);
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter_config()));
        let _sweeper = limiter.spawn_sweeper(cancel.clone());
        let rbac = Arc::new(RbacEvaluator::new());
        broker = broker.with_guard(Box::new(
            BearerGuard::new(tokens, rbac).with_rate_limiter(limiter),
        ));
        log::info!("bearer authentication enabled");
    }

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested");
            signal_cancel.cancel();
        }
    });

    broker.run(cancel).await?;
    let _ = detector.await;
    Ok(())
}

async fn run_echo_worker(endpoint: String, service: &str) -> Result<()> {
    let mut worker = Worker::connect(Box::new(TcpConnector::new(endpoint)), service).await?;

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    log::info!("echo worker registered for {service}");
    let mut reply: Option<Vec<Bytes>> = None;
    while let Some(request) = worker.recv(reply.take()).await? {
        log::info!("serving {} frame(s)", request.len());
        reply = Some(request);
    }
    Ok(())
}

async fn run_request(
    endpoint: String,
    service: &str,
    payload: Vec<Bytes>,
    timeout: Duration,
) -> Result<()> {
    let mut client = Client::connect(Box::new(TcpConnector::new(endpoint))).await?;
    client.set_timeout(timeout);
    client.send(service, payload).await?;

    let mut stream = client.recv_stream();
    while let Some((payload, is_final)) = stream.next().await? {
        let text: Vec<String> = payload
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect();
        let marker = if is_final { "final" } else { "partial" };
        println!("[{marker}] {}", text.join(" | "));
    }
    Ok(())
}
