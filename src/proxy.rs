use anyhow::{Context, Result};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info};

use crate::classify::{ConnectionKind, classify};
use crate::config::Config;
use crate::relay::{RelayStats, relay_full_duplex, relay_multiplexed};
use crate::selector::TargetSelector;

/// State shared by every connection handler.
#[derive(Debug)]
pub struct Proxy {
    config: Config,
    selector: TargetSelector,
}

impl Proxy {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid proxy configuration")?;
        let selector = TargetSelector::new(config.target_port.clone())?;
        Ok(Self { config, selector })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn selector(&self) -> &TargetSelector {
        &self.selector
    }
}

/// How a connection that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client closed before sending anything; no backend was contacted.
    ClientClosedEarly,
    Forwarded {
        kind: ConnectionKind,
        target_port: u16,
        stats: RelayStats,
    },
}

async fn connect_backend(addr: &str, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let connect = TcpStream::connect(addr);
    let result = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .with_context(|| format!("Timed out connecting to target {addr}"))?,
        None => connect.await,
    };
    result.with_context(|| format!("Failed to connect to target {addr}"))
}

/// Serves one accepted client from first byte to close.
///
/// Reads the first chunk, picks the next backend port, replays the chunk to
/// the backend and relays traffic until either side closes. Both sockets are
/// closed when this returns, whatever the result.
#[tracing::instrument(skip_all, fields(client_addr = %client_addr))]
pub async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    proxy: &Proxy,
) -> Result<Outcome> {
    let buffer_size = proxy.config.buffer_size;
    let mut initial = vec![0u8; buffer_size];
    let n = client
        .read(&mut initial)
        .await
        .context("Failed to read initial request from client")?;
    if n == 0 {
        debug!("Client closed before sending data");
        return Ok(Outcome::ClientClosedEarly);
    }
    initial.truncate(n);

    let request = std::str::from_utf8(&initial).context("Initial request is not valid UTF-8")?;
    let kind = classify(request);
    let target_port = proxy.selector.next_target();
    let target_addr = proxy.config.target_addr(target_port);

    match kind {
        ConnectionKind::WebSocket => {
            info!(target_addr = %target_addr, "Forwarding WebSocket request");
        }
        ConnectionKind::Plain => {
            info!(target_addr = %target_addr, bytes = n, "Forwarding request");
        }
    }

    let mut backend = connect_backend(&target_addr, proxy.config.connect_timeout()).await?;
    debug!(target_addr = %target_addr, "Connected to target server");

    backend
        .write_all(&initial)
        .await
        .with_context(|| format!("Failed to send initial request to target {target_addr}"))?;

    let mut stats = match kind {
        ConnectionKind::WebSocket => {
            relay_full_duplex(&mut client, &mut backend, buffer_size).await?
        }
        ConnectionKind::Plain => relay_multiplexed(&mut client, &mut backend, buffer_size).await?,
    };
    stats.client_to_backend += n as u64;

    info!(
        target_addr = %target_addr,
        client_to_backend = stats.client_to_backend,
        backend_to_client = stats.backend_to_client,
        "Proxy connection closed"
    );

    Ok(Outcome::Forwarded {
        kind,
        target_port,
        stats,
    })
}
