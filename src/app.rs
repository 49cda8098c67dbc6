use crate::config::Settings;
use crate::provider::ollama::OllamaProvider;
use crate::provider::stub::StubProvider;
use crate::provider::{GenerateError, Provider};
use crate::server::ConnectionServer;
use anyhow::Context;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use tokio_stream::StreamExt;

pub fn build_provider(settings: &Settings) -> anyhow::Result<Arc<dyn Provider>> {
    match settings.provider.as_str() {
        "ollama" => {
            tracing::info!(
                model_type = settings.generation.model.label(),
                model = settings.generation.model_name(),
                upstream = %settings.upstream,
                "using Ollama provider"
            );
            Ok(Arc::new(OllamaProvider::new(
                settings.upstream.clone(),
                settings.generation.clone(),
            )))
        }
        "stub" => Ok(Arc::new(StubProvider::new())),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

pub async fn cmd_serve(settings: &Settings) -> anyhow::Result<()> {
    let provider = build_provider(settings)?;
    let config = settings.server_config().await?;

    let server = ConnectionServer::bind(&config, provider)
        .await
        .context("failed to start server")?;
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && handle.is_running() {
            tracing::info!(
                active = handle.active_connections(),
                "received interrupt, shutting down"
            );
            handle.stop();
        }
    });

    server.run().await;
    Ok(())
}

pub async fn cmd_ask(settings: &Settings, prompt: String) -> anyhow::Result<()> {
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: llmchat ask \"Hello\"");
    }
    let provider = build_provider(settings)?;

    let mut stream = provider
        .stream_generate(prompt)
        .await
        .context("provider failed to start streaming")?;

    let mut wrote = false;
    let mut out = std::io::stdout();
    while let Some(item) = stream.next().await {
        let fragment = item.context("stream fragment error")?;
        print!("{}", fragment.text);
        out.flush().ok();
        wrote = true;
    }
    if !wrote {
        println!("{}", GenerateError::NoFragments.fallback_text());
    }
    println!();
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

pub async fn cmd_check(settings: &Settings) -> anyhow::Result<()> {
    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let url = format!("http://{}/api/tags", settings.upstream);
    println!("Testing connection to LLM service at {url}");

    let resp = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("LLM service error: HTTP {status}: {text}");
    }

    let tags: TagsResponse = resp.json().await.context("failed to parse model list")?;
    println!("Connected. {} model(s) available:", tags.models.len());
    for m in &tags.models {
        match m.size {
            Some(bytes) => println!("  {}\t{:.1} GB", m.name, bytes as f64 / 1e9),
            None => println!("  {}", m.name),
        }
    }

    let wanted = settings.generation.model_name();
    if model_available(&tags.models, wanted) {
        println!("Configured model '{wanted}' is available.");
    } else {
        println!("Configured model '{wanted}' was not found; pull it before serving.");
    }
    Ok(())
}

/// Ollama lists `llama3:latest` for a request naming `llama3`.
fn model_available(models: &[ModelEntry], wanted: &str) -> bool {
    models.iter().any(|m| {
        m.name == wanted
            || m
                .name
                .split_once(':')
                .is_some_and(|(base, tag)| base == wanted && tag == "latest")
    })
}
