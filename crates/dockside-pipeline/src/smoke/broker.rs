//! Liveness check for the cache/broker over RESP.

use std::net::SocketAddr;
use std::time::Duration;

use dockside_core::{DeployError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

/// Send `PING` and expect `+PONG`.
pub async fn ping(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let unreachable = |detail: String| DeployError::BrokerUnreachable {
        addr: addr.to_string(),
        detail,
    };

    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(PING).await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok::<_, std::io::Error>(line)
    };

    let line = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| unreachable(format!("no reply within {}s", timeout.as_secs())))?
        .map_err(|e| unreachable(e.to_string()))?;

    let reply = line.trim_end();
    debug!(addr = %addr, reply = %reply, "Broker replied");
    if reply == "+PONG" {
        Ok(())
    } else {
        Err(unreachable(format!("unexpected reply {reply:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn fake_broker(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            socket.write_all(reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_pong() {
        let addr = fake_broker(b"+PONG\r\n").await;
        ping(addr, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_required_is_unreachable() {
        let addr = fake_broker(b"-NOAUTH Authentication required.\r\n").await;
        let err = ping(addr, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.kind(), "broker_unreachable");
        assert!(err.to_string().contains("NOAUTH"));
    }
}
