//! Service reachability probe

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Checks whether a port on a resource accepts connections
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_reachable(&self, address: Ipv4Addr, port: u16) -> bool;
}

/// TCP connect with a per-attempt timeout
pub struct TcpPortProbe {
    connect_timeout: Duration,
}

impl TcpPortProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_reachable(&self, address: Ipv4Addr, port: u16) -> bool {
        let target = SocketAddr::from((address, port));
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!(%target, "connect failed: {}", e);
                false
            }
            Err(_) => {
                trace!(%target, "connect timed out");
                false
            }
        }
    }
}
