//! Byte relay between the caller and the resource
//!
//! Used as an SSH `ProxyCommand`: stdin goes to the VM's service port and
//! everything the VM sends goes to stdout. The relay ends when the VM
//! closes its side.

use crate::error::{VmgateError, VmgateResult};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub sent: u64,
    pub received: u64,
}

/// Connect to the service and relay stdin/stdout through it
pub async fn handoff_stdio(
    address: Ipv4Addr,
    port: u16,
    connect_timeout: Duration,
) -> VmgateResult<Transfer> {
    let stream = connect(address, port, connect_timeout).await?;
    let transfer = splice(tokio::io::stdin(), tokio::io::stdout(), stream).await?;
    debug!(sent = transfer.sent, received = transfer.received, "Handoff finished");
    Ok(transfer)
}

/// Open a TCP connection to the service, bounded by `timeout`
pub async fn connect(address: Ipv4Addr, port: u16, timeout: Duration) -> VmgateResult<TcpStream> {
    let target = SocketAddr::from((address, port));
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            stream
                .set_nodelay(true)
                .map_err(|e| VmgateError::io("setting TCP_NODELAY", e))?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(VmgateError::io(format!("connecting to {}", target), e)),
        Err(_) => Err(VmgateError::ServiceNotReady {
            address: address.to_string(),
            port,
            waited_secs: timeout.as_secs(),
        }),
    }
}

/// Copy `input` to the stream and the stream to `output`.
///
/// When `input` ends the stream's write side is shut down; the relay
/// returns once the remote side closes.
pub async fn splice<R, W>(mut input: R, mut output: W, stream: TcpStream) -> VmgateResult<Transfer>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut remote_read, mut remote_write) = stream.into_split();

    let upstream = async {
        let n = tokio::io::copy(&mut input, &mut remote_write).await?;
        remote_write.shutdown().await?;
        Ok::<_, std::io::Error>(n)
    };
    let downstream = async {
        let n = tokio::io::copy(&mut remote_read, &mut output).await?;
        output.flush().await?;
        Ok::<_, std::io::Error>(n)
    };
    tokio::pin!(upstream, downstream);

    let mut sent = None;
    loop {
        tokio::select! {
            result = &mut upstream, if sent.is_none() => {
                sent = Some(result.map_err(|e| VmgateError::io("relaying to resource", e))?);
            }
            result = &mut downstream => {
                let received = result.map_err(|e| VmgateError::io("relaying from resource", e))?;
                return Ok(Transfer {
                    sent: sent.unwrap_or(0),
                    received,
                });
            }
        }
    }
}
