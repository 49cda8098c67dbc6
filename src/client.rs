use crate::transport::{ByteChannel, Received};
use anyhow::Context;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

const POLL: Duration = Duration::from_secs(1);
const ERROR_PAUSE: Duration = Duration::from_millis(100);
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Interactive terminal client: every stdin line is one message, every
/// receive is printed as one reply.
pub async fn run(target: &str) -> anyhow::Result<()> {
    println!("Connecting to server at {target}...");
    let stream = TcpStream::connect(target)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    let mut channel = ByteChannel::new(stream);
    tracing::debug!(%target, "connected");
    println!("Type your message and press Enter. Type 'exit' to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut errors = 0u32;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let msg = line.trim_end();
                if msg == "exit" {
                    break;
                }
                if msg.is_empty() {
                    prompt();
                    continue;
                }
                if let Err(e) = channel.send(msg.as_bytes()).await {
                    eprintln!("Failed to send message: {e}");
                }
            }
            received = channel.receive(POLL) => match received {
                Ok(Received::Data(bytes)) => {
                    errors = 0;
                    let stamp = chrono::Local::now().format("%H:%M:%S");
                    println!("\nLLM ({stamp}): {}", String::from_utf8_lossy(&bytes));
                    prompt();
                }
                Ok(Received::Timeout) => errors = errors.saturating_sub(1),
                Ok(Received::Closed) => {
                    eprintln!("\nServer closed the connection");
                    break;
                }
                Err(e) => {
                    errors += 1;
                    tracing::debug!(error = %e, errors, "receive error");
                    if errors >= MAX_CONSECUTIVE_ERRORS {
                        anyhow::bail!("connection to server lost after multiple errors");
                    }
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            },
        }
    }

    channel.shutdown().await;
    Ok(())
}

fn prompt() {
    print!("You: ");
    std::io::stdout().flush().ok();
}
