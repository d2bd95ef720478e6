//! Bidirectional traffic forwarder.
//!
//! Copies bytes between the two wrapped streams of a connection session until
//! either direction terminates, then drops both streams. The still-running
//! opposite direction is torn down with them; there is no graceful half-close
//! draining. Payload content is never inspected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Bytes moved in each direction before the relay ended.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayResult {
    /// Bytes from the front-end stream to the back-end stream (upload)
    pub a_to_b: u64,
    /// Bytes from the back-end stream to the front-end stream (download)
    pub b_to_a: u64,
}

/// Copy one direction, keeping the shared counter current per chunk so the
/// total is accurate even when the relay is abandoned mid-transfer.
async fn pipe<R, W>(mut reader: R, mut writer: W, copied: Arc<AtomicU64>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Relay bytes between stream `a` (front-end) and stream `b` (back-end) in
/// both directions concurrently. Returns as soon as either direction observes
/// end-of-stream or an I/O error; an error here is normal connection
/// termination, not a fault.
pub async fn relay<A, B>(a: A, b: B) -> RelayResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let up = pipe(a_read, b_write, Arc::clone(&a_to_b));
    let down = pipe(b_read, a_write, Arc::clone(&b_to_a));
    tokio::pin!(up);
    tokio::pin!(down);

    // First direction to finish wins; both halves are dropped on return.
    tokio::select! {
        _ = &mut up => {}
        _ = &mut down => {}
    }

    RelayResult {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    }
}
