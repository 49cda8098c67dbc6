pub mod ollama;
pub mod stream;
pub mod stub;
mod types;

pub use types::{Fragment, FragmentStream, GenerationOptions, ModelKind, Provider, StartFuture};

use crate::transport::TransportError;
use std::io;
use tokio_stream::StreamExt;

/// Reply used when the upstream produced nothing usable.
pub const NO_VALID_RESPONSE: &str =
    "No valid response received from Ollama. Please check if Ollama is running correctly.";

/// Terminal outcomes of one upstream exchange. None of these ends the session;
/// each has fixed text the client sees instead of an answer.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("empty prompt")]
    EmptyPrompt,

    #[error("could not resolve upstream host {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("upstream unavailable at {addr}: {source}")]
    UpstreamUnavailable { addr: String, source: io::Error },

    #[error("failed to send request upstream: {0}")]
    Send(#[source] TransportError),

    #[error("failed to receive upstream data: {0}")]
    Receive(#[source] TransportError),

    #[error("upstream reported an error: {0}")]
    Upstream(String),

    #[error("upstream stream contained no response fragments")]
    NoFragments,
}

impl GenerateError {
    pub fn fallback_text(&self) -> String {
        match self {
            Self::EmptyPrompt => "Error: Empty prompt".to_string(),
            Self::Resolve { .. } => "Error: Could not resolve Ollama hostname".to_string(),
            Self::UpstreamUnavailable { .. } => {
                "Error: Failed to connect to Ollama server".to_string()
            }
            Self::Send(_) => "Error: Failed to send request to Ollama".to_string(),
            Self::Receive(_) => "Error: Failed to receive data from Ollama".to_string(),
            Self::Upstream(msg) => format!("Error: Ollama reported: {msg}"),
            Self::NoFragments => NO_VALID_RESPONSE.to_string(),
        }
    }
}

/// Run one exchange and concatenate its fragments in arrival order.
///
/// An error part-way through discards what was collected. Never returns an
/// empty answer.
pub async fn generate(provider: &dyn Provider, prompt: String) -> Result<String, GenerateError> {
    if prompt.trim().is_empty() {
        return Err(GenerateError::EmptyPrompt);
    }

    let mut stream = provider.stream_generate(prompt).await?;
    let mut answer = String::new();
    let mut fragments = 0usize;
    while let Some(item) = stream.next().await {
        let fragment = item?;
        answer.push_str(&fragment.text);
        fragments += 1;
    }

    if answer.is_empty() {
        return Err(GenerateError::NoFragments);
    }
    tracing::debug!(
        provider = provider.name(),
        fragments,
        bytes = answer.len(),
        "assembled answer"
    );
    Ok(answer)
}

/// Like [`generate`], but every failure becomes its fallback text.
pub async fn respond(provider: &dyn Provider, prompt: String) -> String {
    match generate(provider, prompt).await {
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(provider = provider.name(), error = %e, "generation failed");
            e.fallback_text()
        }
    }
}
