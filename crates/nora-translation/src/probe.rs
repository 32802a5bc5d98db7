//! Stateless checks against the helper's port.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::inspect::{PortInspector, platform_inspector};
use crate::{BoxFuture, PING_PATH};

/// Answers "is something bound here", "who owns it" and "does it answer".
///
/// None of the methods fail: every error is folded into a negative answer,
/// because the supervisor re-checks anything it acts upon.
pub trait PortProber: Send + Sync {
    /// Whether a TCP connect to loopback `port` succeeds.
    fn is_bound(&self, port: u16) -> BoxFuture<'_, bool>;

    /// Pid of the process holding a connection on `port`, if any.
    fn owner_pid(&self, port: u16) -> BoxFuture<'_, Option<u32>>;

    /// Whether `GET <base_url>/connector/ping` gets any HTTP status back
    /// within `timeout`.
    fn probe_alive<'a>(&'a self, base_url: &'a str, timeout: Duration) -> BoxFuture<'a, bool>;
}

/// The real prober: loopback connects, a platform [`PortInspector`] and
/// a reqwest client for the ping.
pub struct LocalProber {
    inspector: Arc<dyn PortInspector>,
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl Default for LocalProber {
    fn default() -> Self {
        Self::new(platform_inspector())
    }
}

impl LocalProber {
    pub fn new(inspector: Box<dyn PortInspector>) -> Self {
        Self {
            inspector: Arc::from(inspector),
            client: reqwest::Client::new(),
            connect_timeout: Duration::from_millis(250),
        }
    }
}

impl PortProber for LocalProber {
    fn is_bound(&self, port: u16) -> BoxFuture<'_, bool> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            matches!(
                tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await,
                Ok(Ok(_))
            )
        })
    }

    fn owner_pid(&self, port: u16) -> BoxFuture<'_, Option<u32>> {
        Box::pin(async move {
            // Inspectors walk procfs or run lsof/netstat.
            let inspector = self.inspector.clone();
            let lookup = tokio::task::spawn_blocking(move || inspector.owner_pid(port)).await;
            match lookup {
                Ok(Ok(pid)) => pid,
                Ok(Err(e)) => {
                    tracing::debug!(
                        port,
                        inspector = self.inspector.name(),
                        error = %e,
                        "port owner lookup failed"
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(port, error = %e, "port owner lookup task failed");
                    None
                }
            }
        })
    }

    fn probe_alive<'a>(&'a self, base_url: &'a str, timeout: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let url = format!("{}{}", base_url.trim_end_matches('/'), PING_PATH);
            match self.client.get(&url).timeout(timeout).send().await {
                Ok(resp) => {
                    tracing::trace!(url, status = %resp.status(), "liveness probe answered");
                    true
                }
                Err(e) => {
                    tracing::trace!(url, error = %e, "liveness probe failed");
                    false
                }
            }
        })
    }
}
