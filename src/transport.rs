use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message a single receive can return.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Pause after every complete send so the peer does not see two
/// back-to-back messages coalesced into one read.
pub const POST_SEND_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
}

/// Outcome of one bounded receive. Errors are reported separately through
/// `TransportError`; none of these variants is a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    /// Nothing arrived within the wait window.
    Timeout,
    /// The peer shut down its write side.
    Closed,
}

/// One connected byte stream with full-write sends and time-bounded reads.
///
/// There is no framing: whatever a single read returns is one message.
#[derive(Debug)]
pub struct ByteChannel<S> {
    stream: S,
    buf: Vec<u8>,
    send_delay: Duration,
}

impl<S> ByteChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: vec![0u8; MAX_MESSAGE_SIZE],
            send_delay: POST_SEND_DELAY,
        }
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Write all of `bytes`, retrying interrupted writes.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let mut sent = 0;
        while sent < bytes.len() {
            match self.stream.write(&bytes[sent..]).await {
                Ok(0) => {
                    return Err(TransportError::Send(io::Error::from(
                        io::ErrorKind::WriteZero,
                    )))
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Send(e)),
            }
        }
        self.stream.flush().await.map_err(TransportError::Send)?;

        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        Ok(sent)
    }

    /// Wait up to `wait` for readable data, then perform exactly one read.
    ///
    /// Cancel-safe for sockets: dropping the future before it completes
    /// loses no bytes.
    pub async fn receive(&mut self, wait: Duration) -> Result<Received, TransportError> {
        match tokio::time::timeout(wait, self.stream.read(&mut self.buf)).await {
            Err(_) => Ok(Received::Timeout),
            Ok(Ok(0)) => Ok(Received::Closed),
            Ok(Ok(n)) => Ok(Received::Data(self.buf[..n].to_vec())),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Received::Timeout)
            }
            Ok(Err(e)) => Err(TransportError::Receive(e)),
        }
    }

    /// Close the write side. Dropping the channel closes the whole stream.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(error = %e, "shutdown of byte channel failed");
        }
    }
}
