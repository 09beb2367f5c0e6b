// rust/rv-core/src/rendezvous/cluster.rs

//! The cluster runtime the rendezvous bootstraps.

use std::collections::BTreeSet;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::error::{Result, RvError};
use crate::node::NodeIdentity;
use crate::store::{keys, RecordStore};

/// The distributed runtime started on top of the rendezvous.
///
/// The head starts it and gets back an externally reachable address; workers
/// join it using that address. Membership is queried through the runtime
/// itself, not through the rendezvous records.
pub trait ClusterRuntime: Send {
    /// Starts the runtime in head mode and returns its connection string.
    fn start_head(&mut self) -> Result<String>;

    /// Joins the runtime whose head listens at `address`.
    fn join(&mut self, address: &str) -> Result<()>;

    /// Number of nodes the runtime currently sees as alive, head included.
    fn alive_nodes(&self) -> Result<usize>;

    /// Stops the local runtime process.
    fn shutdown(&mut self) -> Result<()>;
}

/// Minimal runtime whose membership lives in the record store.
///
/// The head "listens" at `<advertise_host>:<port>`; every rank that joins
/// writes a `node.<rank>` marker holding its hostname, and membership is the
/// number of distinct hostnames among the markers. The address is handed to whatever the agent launches
/// next (`MASTER_ADDR`/`MASTER_PORT` style).
pub struct StoreCluster {
    store: Arc<dyn RecordStore>,
    job_id: String,
    node: NodeIdentity,
    advertise_host: Option<String>,
    port: u16,
    joined: bool,
}

impl StoreCluster {
    pub fn new(
        store: Arc<dyn RecordStore>,
        job_id: impl Into<String>,
        node: NodeIdentity,
        advertise_host: Option<String>,
        port: u16,
    ) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            node,
            advertise_host,
            port,
            joined: false,
        }
    }

    fn register(&mut self) -> Result<()> {
        self.store
            .write(&self.job_id, &keys::node(self.node.rank), &self.node.hostname)?;
        self.joined = true;
        Ok(())
    }
}

impl ClusterRuntime for StoreCluster {
    fn start_head(&mut self) -> Result<String> {
        let host = match &self.advertise_host {
            Some(host) => host.clone(),
            None => resolve_advertise_host(&self.node.hostname, self.port),
        };
        let address = join_host_port(&host, self.port);

        self.register()?;
        tracing::info!(address = %address, host = %self.node.hostname, "head runtime started");
        Ok(address)
    }

    fn join(&mut self, address: &str) -> Result<()> {
        let (host, port) = split_host_port(address);
        if host.is_empty() || port.is_none() {
            return Err(RvError::cluster(format!(
                "malformed head address '{address}', expected host:port"
            )));
        }

        self.register()?;
        tracing::info!(address, rank = self.node.rank, "joined head runtime");
        Ok(())
    }

    fn alive_nodes(&self) -> Result<usize> {
        let mut hosts = BTreeSet::new();
        for key in self.store.list(&self.job_id)? {
            if !key.starts_with("node.") {
                continue;
            }
            // a marker can vanish between list and read when a rank leaves
            if let Some(host) = self.store.read(&self.job_id, &key)? {
                hosts.insert(host.trim().to_string());
            }
        }
        Ok(hosts.len())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.joined {
            self.store.delete(&self.job_id, &keys::node(self.node.rank));
            self.joined = false;
        }
        Ok(())
    }
}

/// Picks the address other nodes should use to reach `hostname`.
///
/// Prefers the first IPv4 address the hostname resolves to, since compute
/// nodes frequently cannot resolve each other's short names; falls back to
/// the hostname itself.
pub fn resolve_advertise_host(hostname: &str, port: u16) -> String {
    let resolved = (hostname, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(|addr| addr.is_ipv4()));

    match resolved {
        Some(addr) if !addr.ip().is_loopback() => addr.ip().to_string(),
        _ => hostname.to_string(),
    }
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

/// Splits a connection string into host and optional port.
///
/// Accepts `host`, `host:port`, `[v6]:port` and an optional scheme prefix
/// such as `tcp://`.
pub fn split_host_port(address: &str) -> (&str, Option<u16>) {
    let address = address.trim();
    let address = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);

    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }

    match address.rsplit_once(':') {
        // more than one ':' without brackets is a bare IPv6 literal
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (address, None),
        },
        _ => (address, None),
    }
}
