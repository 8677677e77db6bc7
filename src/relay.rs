use log::debug;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction before the relay stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *counter += n as u64;
    }
}

/// Copies bytes between `a` and `b` in both directions until either side
/// reaches end-of-stream or fails, then shuts down and drops both streams.
///
/// No bytes are inspected or buffered beyond a single read.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut stats = RelayStats::default();

    {
        let forward = pump(&mut a_read, &mut b_write, &mut stats.a_to_b);
        let backward = pump(&mut b_read, &mut a_write, &mut stats.b_to_a);

        tokio::select! {
            result = forward => match result {
                Ok(()) => debug!("Relay: first stream closed"),
                Err(e) => debug!("Relay: error copying first -> second: {}", e),
            },
            result = backward => match result {
                Ok(()) => debug!("Relay: second stream closed"),
                Err(e) => debug!("Relay: error copying second -> first: {}", e),
            },
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    stats
}
