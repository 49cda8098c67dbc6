use crate::provider::{respond, Provider};
use crate::transport::{ByteChannel, Received};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

pub const GREETING: &str = "Connected to LLM Chat Server. Type your message and press Enter.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long one receive waits before reporting a timeout.
    pub receive_timeout: Duration,
    /// Pause after a receive error before polling again.
    pub error_pause: Duration,
    /// Consecutive receive errors after which the connection counts as lost.
    pub error_threshold: u32,
    /// Pause after each complete send.
    pub send_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            error_pause: Duration::from_millis(50),
            error_threshold: 5,
            send_delay: crate::transport::POST_SEND_DELAY,
        }
    }
}

#[derive(Debug)]
enum State {
    Greeting,
    AwaitMessage,
    Generating(String),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    SendFailed,
    TooManyErrors,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub exchanges: u64,
    pub reason: CloseReason,
}

/// Serves one client: greet, then answer each message in turn until the
/// client leaves or the server closes the connection.
pub struct ChatSession<S> {
    channel: ByteChannel<S>,
    provider: Arc<dyn Provider>,
    config: SessionConfig,
    close: watch::Receiver<bool>,
}

impl<S> ChatSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        provider: Arc<dyn Provider>,
        config: SessionConfig,
        close: watch::Receiver<bool>,
    ) -> Self {
        Self {
            channel: ByteChannel::new(stream).with_send_delay(config.send_delay),
            provider,
            config,
            close,
        }
    }

    pub async fn run(mut self) -> SessionSummary {
        let mut state = State::Greeting;
        let mut timeouts = 0u64;
        let mut errors = 0u32;
        let mut exchanges = 0u64;

        let reason = loop {
            state = match state {
                State::Greeting => match self.channel.send(GREETING.as_bytes()).await {
                    Ok(_) => State::AwaitMessage,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to send greeting");
                        State::Closed(CloseReason::SendFailed)
                    }
                },
                State::AwaitMessage => {
                    if *self.close.borrow() {
                        State::Closed(CloseReason::Shutdown)
                    } else {
                        let received = tokio::select! {
                            _ = self.close.changed() => None,
                            r = self.channel.receive(self.config.receive_timeout) => Some(r),
                        };
                        match received {
                            None => State::Closed(CloseReason::Shutdown),
                            Some(Ok(Received::Timeout)) => {
                                errors = 0;
                                timeouts += 1;
                                if timeouts % 100 == 0 {
                                    tracing::debug!(timeouts, "client idle");
                                }
                                State::AwaitMessage
                            }
                            Some(Ok(Received::Closed)) => State::Closed(CloseReason::PeerClosed),
                            Some(Ok(Received::Data(bytes))) => {
                                timeouts = 0;
                                errors = 0;
                                State::Generating(prompt_from(&bytes))
                            }
                            Some(Err(e)) => {
                                errors += 1;
                                tracing::debug!(error = %e, errors, "receive error");
                                if errors >= self.config.error_threshold {
                                    tracing::warn!(errors, "too many consecutive receive errors");
                                    State::Closed(CloseReason::TooManyErrors)
                                } else {
                                    tokio::time::sleep(self.config.error_pause).await;
                                    State::AwaitMessage
                                }
                            }
                        }
                    }
                }
                State::Generating(prompt) => {
                    tracing::debug!(%prompt, "generating response");
                    let reply = respond(self.provider.as_ref(), prompt).await;
                    if *self.close.borrow() {
                        State::Closed(CloseReason::Shutdown)
                    } else {
                        match self.channel.send(reply.as_bytes()).await {
                            Ok(n) => {
                                exchanges += 1;
                                tracing::debug!(bytes = n, "sent response");
                                State::AwaitMessage
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to send response");
                                State::Closed(CloseReason::SendFailed)
                            }
                        }
                    }
                }
                State::Closed(reason) => break reason,
            };
        };

        self.channel.shutdown().await;
        SessionSummary { exchanges, reason }
    }
}

/// Bytes up to the first NUL, decoded lossily, without the trailing newline.
fn prompt_from(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::StubProvider;
    use crate::provider::{GenerateError, StartFuture};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

    fn fast() -> SessionConfig {
        SessionConfig {
            receive_timeout: Duration::from_millis(10),
            error_pause: Duration::from_millis(1),
            error_threshold: 5,
            send_delay: Duration::ZERO,
        }
    }

    struct Unreachable;

    impl Provider for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        fn stream_generate(&self, _prompt: String) -> StartFuture {
            Box::pin(async {
                Err(GenerateError::UpstreamUnavailable {
                    addr: "localhost:11434".to_string(),
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                })
            })
        }
    }

    async fn read_some(client: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    fn start(
        provider: Arc<dyn Provider>,
    ) -> (
        DuplexStream,
        watch::Sender<bool>,
        tokio::task::JoinHandle<SessionSummary>,
    ) {
        let (client, server) = tokio::io::duplex(8192);
        let (close_tx, close_rx) = watch::channel(false);
        let session = ChatSession::new(server, provider, fast(), close_rx);
        (client, close_tx, tokio::spawn(session.run()))
    }

    #[tokio::test]
    async fn greets_then_answers_each_message_in_turn() {
        let (mut client, _close, task) = start(Arc::new(StubProvider::instant()));
        assert_eq!(read_some(&mut client).await, GREETING);

        for msg in ["one", "two"] {
            client.write_all(msg.as_bytes()).await.unwrap();
            assert_eq!(read_some(&mut client).await, format!("You said: {msg}"));
        }

        drop(client);
        let summary = task.await.unwrap();
        assert_eq!(summary.exchanges, 2);
        assert_eq!(summary.reason, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn idle_client_stays_connected() {
        let (mut client, _close, task) = start(Arc::new(StubProvider::instant()));
        read_some(&mut client).await;

        // Many receive timeouts pass.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());

        client.write_all(b"still here\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, "You said: still here");
    }

    #[tokio::test]
    async fn failed_generation_sends_fallback_and_continues() {
        let (mut client, _close, task) = start(Arc::new(Unreachable));
        read_some(&mut client).await;

        client.write_all(b"hello").await.unwrap();
        assert_eq!(
            read_some(&mut client).await,
            "Error: Failed to connect to Ollama server"
        );
        assert!(!task.is_finished());

        client.write_all(b"again").await.unwrap();
        assert_eq!(
            read_some(&mut client).await,
            "Error: Failed to connect to Ollama server"
        );
    }

    #[tokio::test]
    async fn close_signal_ends_session() {
        let (mut client, close, task) = start(Arc::new(StubProvider::instant()));
        read_some(&mut client).await;

        close.send_replace(true);
        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Shutdown);
    }

    /// Accepts writes, fails every read.
    struct BrokenReads {
        reads: Arc<std::sync::atomic::AtomicU32>,
    }

    impl AsyncRead for BrokenReads {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    impl AsyncWrite for BrokenReads {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn repeated_receive_errors_close_the_session() {
        let reads = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let stream = BrokenReads {
            reads: Arc::clone(&reads),
        };
        let (_close_tx, close_rx) = watch::channel(false);
        let session = ChatSession::new(stream, Arc::new(StubProvider::instant()), fast(), close_rx);

        let summary = session.run().await;
        assert_eq!(summary.reason, CloseReason::TooManyErrors);
        assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst), 5);
    }

    /// Fails a read, then stays silent long enough for two receive
    /// timeouts before failing again.
    struct IntermittentErrors {
        failures: Arc<std::sync::atomic::AtomicU32>,
        last_failure: Option<std::time::Instant>,
    }

    const QUIET_WINDOW: Duration = Duration::from_millis(25);

    impl AsyncRead for IntermittentErrors {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let quiet = self
                .last_failure
                .is_some_and(|at| at.elapsed() < QUIET_WINDOW);
            if quiet {
                // The receive timer wakes the task.
                return Poll::Pending;
            }
            self.last_failure = Some(std::time::Instant::now());
            self.failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    impl AsyncWrite for IntermittentErrors {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn errors_separated_by_timeouts_do_not_close_the_session() {
        let failures = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let stream = IntermittentErrors {
            failures: Arc::clone(&failures),
            last_failure: None,
        };
        let (close_tx, close_rx) = watch::channel(false);
        let session = ChatSession::new(stream, Arc::new(StubProvider::instant()), fast(), close_rx);
        let task = tokio::spawn(session.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while failures.load(std::sync::atomic::Ordering::SeqCst) < 8
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failures.load(std::sync::atomic::Ordering::SeqCst) >= 8);
        assert!(!task.is_finished());

        close_tx.send_replace(true);
        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Shutdown);
    }

    #[test]
    fn prompt_stops_at_nul_and_drops_newline() {
        assert_eq!(prompt_from(b"hello\r\n"), "hello");
        assert_eq!(prompt_from(b"abc\0junk"), "abc");
        assert_eq!(prompt_from(b"  spaced  "), "  spaced  ");
    }
}
