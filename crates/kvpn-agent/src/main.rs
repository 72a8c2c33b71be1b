//! kvpn-agent: the thin binary that wires `kvpn-core`'s `Chain`,
//! `kvpn-device`'s virtual interface, and `kvpn-handler`'s `AutoHandler`
//! together behind a listening socket.
//!
//! The CLI surface stays deliberately thin: config path plus a couple of
//! overrides, `tracing-subscriber` init, graceful shutdown on
//! SIGINT/SIGTERM. A full flag parser, Kubernetes discovery and credential
//! store are external collaborators that would hand this binary an
//! already-resolved chain and route table.

mod config;

use anyhow::Context;
use clap::Parser;
use config::AgentConfig;
use kvpn_core::{default_client, BoxedConn, Chain, Node, TransportKind};
use kvpn_device::TunDevice;
use kvpn_handler::{AutoHandler, HandlerOptionsBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Ceiling on one IP packet read from the device, matched to the u16
/// length prefix used to frame packets over the tunnel connection.
const MAX_PACKET_SIZE: usize = 65535;

/// Initial and ceiling backoff between tunnel reconnect attempts.
const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "kvpn-agent", about = "kvpn data-plane agent")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address from the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Override the log level from the config file.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref(), cli.listen, cli.log_level)
        .context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    info!(listen = %config.listen, nodes = config.nodes.len(), "starting kvpn-agent");

    let device = kvpn_device::Device::open(config.device_name.as_deref())
        .context("opening virtual interface")?;
    let device = Arc::new(device);

    let chain = Arc::new(build_chain(&config));
    let packet_chain = chain.clone();

    let mut builder = HandlerOptionsBuilder::new()
        .address(config.listen.clone())
        .chain(chain)
        .users(config.users.clone())
        .retries(config.retries)
        .max_fails(config.max_fails)
        .fail_timeout(Duration::from_secs(config.fail_timeout_secs));
    if let Some(host) = &config.knocking_host {
        builder = builder.knocking_host(host.clone());
    }
    let options = builder.build().context("validating handler options")?;
    let handler = Arc::new(AutoHandler::new(options));

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(addr = %config.listen, "listening");

    let ct = CancellationToken::new();
    let forwarder = tokio::spawn(run_packet_forwarder(
        device.clone(),
        packet_chain,
        ct.clone(),
    ));

    run(listener, handler, device, ct).await?;

    if let Err(e) = forwarder.await {
        warn!(error = %e, "packet forwarder task panicked");
    }
    Ok(())
}

/// Translates the config's node list into live `Node`s. `tls`/`kcp`/`quic`
/// transports whose client isn't wired for direct dialing in this build
/// are still represented (so a misconfigured chain fails per-dial with
/// `Unsupported`, not at startup) — only `tcp` and `ws` get a working
/// `NodeClient`.
fn build_chain(config: &AgentConfig) -> Chain {
    let nodes: Vec<Arc<Node>> = config
        .nodes
        .iter()
        .map(|n| {
            let transport = match n.transport.as_str() {
                "tcp" => TransportKind::Tcp,
                "tls" => TransportKind::Tls,
                "ws" => TransportKind::Ws,
                "kcp" => TransportKind::Kcp,
                "quic" => TransportKind::Quic,
                other => {
                    warn!(transport = other, "unknown transport kind, treating as tcp");
                    TransportKind::Tcp
                }
            };
            Arc::new(Node::new(n.address.clone(), transport, default_client(transport)))
        })
        .collect();

    Chain::new(
        nodes,
        config.retries,
        config.max_fails,
        Duration::from_secs(config.fail_timeout_secs),
    )
}

async fn run(
    listener: TcpListener,
    handler: Arc<AutoHandler>,
    device: Arc<kvpn_device::Device>,
    ct: CancellationToken,
) -> anyhow::Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let conn: kvpn_core::BoxedConn = Box::new(stream);
                            if let Err(e) = handler.handle(conn).await {
                                warn!(%peer, error = %e, "connection handler failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
    }

    ct.cancel();
    if let Err(e) = device.close().await {
        warn!(error = %e, "error closing device during shutdown");
    }
    Ok(())
}

/// Establishes the tunnel that carries the device's raw IP packets to the
/// chain's terminal node, and keeps re-establishing it (with backoff) until
/// `ct` is cancelled — the device itself outlives any number of tunnel
/// drops, so a dial failure here is a retry, not a shutdown.
async fn run_packet_forwarder(
    device: Arc<kvpn_device::Device>,
    chain: Arc<Chain>,
    ct: CancellationToken,
) {
    let mut backoff = RECONNECT_BACKOFF_START;

    while !ct.is_cancelled() {
        let tunnel = match chain.conn(&ct).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                if ct.is_cancelled() {
                    break;
                }
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "tunnel dial failed, retrying");
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                continue;
            }
        };

        backoff = RECONNECT_BACKOFF_START;
        info!("packet tunnel established");
        if let Err(e) = forward_packets(&device, tunnel, &ct).await {
            if !ct.is_cancelled() {
                warn!(error = %e, "packet tunnel closed, reconnecting");
            }
        }
    }
    debug!("packet forwarder stopped");
}

/// Runs the device's reader/writer tasks against one tunnel connection:
/// packets read off the device are length-prefixed and written to the
/// tunnel, and length-prefixed frames read from the tunnel are written
/// back to the device. Returns when either direction errors, the tunnel
/// closes, or `ct` is cancelled.
async fn forward_packets(
    device: &Arc<kvpn_device::Device>,
    tunnel: BoxedConn,
    ct: &CancellationToken,
) -> anyhow::Result<()> {
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    let reader = {
        let device = device.clone();
        async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let n = device
                    .read_packet(&mut buf)
                    .await
                    .context("reading packet from device")?;
                tunnel_write
                    .write_u16(n as u16)
                    .await
                    .context("writing packet length to tunnel")?;
                tunnel_write
                    .write_all(&buf[..n])
                    .await
                    .context("writing packet body to tunnel")?;
            }
            #[allow(unreachable_code)]
            Ok::<(), anyhow::Error>(())
        }
    };

    let writer = {
        let device = device.clone();
        async move {
            loop {
                let len = tunnel_read
                    .read_u16()
                    .await
                    .context("reading packet length from tunnel")? as usize;
                let mut buf = vec![0u8; len];
                tunnel_read
                    .read_exact(&mut buf)
                    .await
                    .context("reading packet body from tunnel")?;
                device
                    .write_packet(&buf)
                    .await
                    .context("writing packet to device")?;
            }
            #[allow(unreachable_code)]
            Ok::<(), anyhow::Error>(())
        }
    };

    tokio::select! {
        biased;
        _ = ct.cancelled() => Ok(()),
        result = reader => result,
        result = writer => result,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
