use crate::error::ProxyError;
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A bidirectional byte stream; closing happens on shutdown or drop.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn DuplexStream>;

#[async_trait]
pub trait UpstreamDialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16, deadline: Option<Duration>) -> Result<BoxedStream, ProxyError>;
}

/// Plain TCP dialer. DNS resolution happens inside `TcpStream::connect`.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl UpstreamDialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16, deadline: Option<Duration>) -> Result<BoxedStream, ProxyError> {
        let connect = TcpStream::connect((host, port));
        let result = match deadline {
            Some(deadline) => timeout(deadline, connect).await.map_err(|_| ProxyError::DialTimeout {
                host: host.to_string(),
                port,
            })?,
            None => connect.await,
        };

        let stream = result.map_err(|source| ProxyError::Dial {
            host: host.to_string(),
            port,
            source,
        })?;
        let _ = stream.set_nodelay(true);
        debug!("Connected to upstream {}:{}", host, port);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_reachable_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let mut stream = TcpDialer.dial("127.0.0.1", port, Some(Duration::from_secs(5))).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = match TcpDialer.dial("127.0.0.1", port, Some(Duration::from_secs(5))).await {
            Ok(_) => panic!("dial to a closed port succeeded"),
            Err(e) => e,
        };
        assert!(err.is_dial_failure());
    }

    #[tokio::test]
    async fn test_dial_unresolvable_host_is_dial_failure() {
        let err = match TcpDialer.dial("no-such-host.invalid", 80, Some(Duration::from_secs(5))).await {
            Ok(_) => panic!("dial to an unresolvable host succeeded"),
            Err(e) => e,
        };
        assert!(err.is_dial_failure());
    }
}
