use super::stream::StreamDecoder;
use super::{Fragment, FragmentStream, GenerateError, GenerationOptions, Provider, StartFuture};
use crate::transport::{ByteChannel, Received};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 11434;
const GENERATE_PATH: &str = "/api/generate";

/// Hard limit on one exchange, measured from the moment the request is sent.
pub const EXCHANGE_DEADLINE: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.parse::<std::net::Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Talks to an Ollama-compatible `/api/generate` endpoint over a fresh TCP
/// connection per exchange.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    upstream: Upstream,
    options: GenerationOptions,
    deadline: Duration,
    poll: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    temperature: f64,
    max_tokens: u32,
    options: RequestOptions,
}

#[derive(Debug, Serialize)]
struct RequestOptions {
    num_ctx: u32,
}

impl OllamaProvider {
    pub fn new(upstream: Upstream, options: GenerationOptions) -> Self {
        Self {
            upstream,
            options,
            deadline: EXCHANGE_DEADLINE,
            poll: POLL_INTERVAL,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration, poll: Duration) -> Self {
        self.deadline = deadline;
        self.poll = poll;
        self
    }

    fn request_body(&self, prompt: &str) -> Result<String, serde_json::Error> {
        serde_json::to_string(&GenerateRequest {
            model: self.options.model_name(),
            prompt,
            stream: true,
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            options: RequestOptions {
                num_ctx: self.options.context_size,
            },
        })
    }

    fn http_request(&self, body: &str) -> String {
        format!(
            "POST {GENERATE_PATH} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: application/json\r\n\
             Accept: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            self.upstream,
            body.len(),
        )
    }

    async fn connect(&self) -> Result<TcpStream, GenerateError> {
        let host = self.upstream.host.as_str();
        let addrs: Vec<_> = tokio::net::lookup_host((host, self.upstream.port))
            .await
            .map_err(|source| GenerateError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(GenerateError::Resolve {
                host: host.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            });
        }

        let connect = TcpStream::connect(&addrs[..]);
        let stream = match tokio::time::timeout(self.deadline, connect).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
        }
        .map_err(|source| GenerateError::UpstreamUnavailable {
            addr: self.upstream.to_string(),
            source,
        })?;

        tracing::debug!(upstream = %self.upstream, "connected to upstream");
        Ok(stream)
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn stream_generate(&self, prompt: String) -> StartFuture {
        let this = self.clone();

        Box::pin(async move {
            let stream = this.connect().await?;
            let mut channel = ByteChannel::new(stream);

            let body = this
                .request_body(&prompt)
                .map_err(|e| GenerateError::Upstream(format!("failed to encode request: {e}")))?;
            tracing::debug!(model = this.options.model_name(), %body, "sending generate request");
            let request = this.http_request(&body);
            channel
                .send(request.as_bytes())
                .await
                .map_err(GenerateError::Send)?;

            let (tx, rx) = mpsc::channel::<Result<Fragment, GenerateError>>(64);
            tokio::spawn(async move {
                receive_loop(channel, tx, this.deadline, this.poll).await;
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as FragmentStream)
        })
    }
}

/// Read until the upstream closes or the deadline passes, forwarding every
/// decoded fragment. Returns early if the receiver goes away.
async fn receive_loop(
    mut channel: ByteChannel<TcpStream>,
    tx: mpsc::Sender<Result<Fragment, GenerateError>>,
    deadline: Duration,
    poll: Duration,
) {
    let started = Instant::now();
    let mut decoder = StreamDecoder::new();
    let mut waits = 0u32;

    loop {
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            tracing::warn!(?elapsed, fragments = decoder.fragments(), "upstream exchange hit its deadline");
            break;
        }

        match channel.receive(poll.min(deadline - elapsed)).await {
            Ok(Received::Timeout) => {
                if waits % 5 == 0 {
                    tracing::debug!(elapsed_secs = elapsed.as_secs(), "waiting for upstream");
                }
                waits += 1;
            }
            Ok(Received::Closed) => {
                tracing::debug!("upstream closed the connection");
                break;
            }
            Ok(Received::Data(bytes)) => {
                tracing::trace!(bytes = bytes.len(), "received upstream data");
                for fragment in decoder.push(&bytes) {
                    if tx.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(GenerateError::Receive(e))).await;
                return;
            }
        }
    }

    if let Some(fragment) = decoder.finish() {
        if tx.send(Ok(fragment)).await.is_err() {
            return;
        }
    }

    if decoder.fragments() == 0 {
        if let Some(err) = decoder.upstream_error() {
            let _ = tx.send(Err(GenerateError::Upstream(err.to_string()))).await;
        } else if !decoder.headers_done() {
            tracing::warn!("upstream reply ended before its headers did");
        }
    } else if !decoder.saw_done() {
        tracing::debug!("upstream stream ended without a final object");
    }
}
