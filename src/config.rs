use crate::cli::Args;
use crate::provider::ollama::Upstream;
use crate::provider::{GenerationOptions, ModelKind};
use crate::server::session::SessionConfig;
use crate::server::ServerConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_CLIENT_HOST: &str = "127.0.0.1";

/// On-disk configuration. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub llm: LlmSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSection {
    /// "ollama" or "stub"
    pub provider: Option<String>,
    /// Model type: llama, mistral, gptj or custom.
    pub model: Option<String>,
    pub model_path: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub context_size: Option<u32>,
    /// Upstream service host.
    pub host: Option<String>,
    /// Upstream service port.
    pub port: Option<u16>,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let cfg: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// `$LLMCHAT_HOME/config/config.toml`, then the XDG config dir, then
    /// `~/.config/llmchat/config.toml`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let dir = if let Some(base) = std::env::var_os("LLMCHAT_HOME") {
            PathBuf::from(base).join("config")
        } else if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(xdg).join("llmchat")
        } else {
            let home = std::env::var_os("HOME").context("HOME is not set")?;
            PathBuf::from(home).join(".config").join("llmchat")
        };
        Ok(dir.join("config.toml"))
    }
}

/// Everything the commands need, after merging command line, file and
/// defaults (in that order of precedence).
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: Option<String>,
    pub port: u16,
    pub max_connections: usize,
    pub verbose: bool,
    pub provider: String,
    pub upstream: Upstream,
    pub generation: GenerationOptions,
}

impl Settings {
    pub fn resolve(args: &Args, cfg: Option<&Config>) -> anyhow::Result<Self> {
        let server = cfg.map(|c| &c.server);
        let llm = cfg.map(|c| &c.llm);

        let max_connections = args
            .max_connections
            .or_else(|| server.and_then(|s| s.max_connections))
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }

        let defaults = GenerationOptions::default();
        let generation = GenerationOptions {
            model: args
                .model
                .as_deref()
                .or_else(|| llm.and_then(|l| l.model.as_deref()))
                .map(ModelKind::from_name)
                .unwrap_or(defaults.model),
            model_path: args
                .model_path
                .clone()
                .or_else(|| llm.and_then(|l| l.model_path.clone()))
                .filter(|p| !p.trim().is_empty()),
            temperature: args
                .temperature
                .or_else(|| llm.and_then(|l| l.temperature))
                .unwrap_or(defaults.temperature),
            max_tokens: args
                .max_tokens
                .or_else(|| llm.and_then(|l| l.max_tokens))
                .unwrap_or(defaults.max_tokens),
            context_size: args
                .context_size
                .or_else(|| llm.and_then(|l| l.context_size))
                .unwrap_or(defaults.context_size),
        };

        let upstream_defaults = Upstream::default();
        Ok(Self {
            host: args
                .host
                .clone()
                .or_else(|| server.and_then(|s| s.host.clone())),
            port: args
                .port
                .or_else(|| server.and_then(|s| s.port))
                .unwrap_or(DEFAULT_PORT),
            max_connections,
            verbose: args.verbose || server.and_then(|s| s.verbose).unwrap_or(false),
            provider: args
                .provider
                .clone()
                .or_else(|| llm.and_then(|l| l.provider.clone()))
                .unwrap_or_else(|| "ollama".to_string()),
            upstream: Upstream {
                host: args
                    .upstream_host
                    .clone()
                    .or_else(|| llm.and_then(|l| l.host.clone()))
                    .unwrap_or(upstream_defaults.host),
                port: args
                    .upstream_port
                    .or_else(|| llm.and_then(|l| l.port))
                    .unwrap_or(upstream_defaults.port),
            },
            generation,
        })
    }

    /// Listen address for the server; binds every interface unless a host is
    /// given. Host names are resolved and the first address wins.
    pub async fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let bind = match self.host.as_deref() {
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
            Some(h) => tokio::net::lookup_host((h, self.port))
                .await
                .with_context(|| format!("failed to resolve bind host: {h}"))?
                .next()
                .with_context(|| format!("bind host {h} has no addresses"))?,
        };
        Ok(ServerConfig {
            bind,
            max_connections: self.max_connections,
            session: SessionConfig::default(),
        })
    }

    /// Address the chat client connects to.
    pub fn client_target(&self) -> String {
        let host = self.host.as_deref().unwrap_or(DEFAULT_CLIENT_HOST);
        format!("{host}:{}", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["llmchat"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[tokio::test]
    async fn defaults_without_file_or_flags() {
        let s = Settings::resolve(&args(&[]), None).unwrap();
        assert_eq!(s.port, 8080);
        assert_eq!(s.max_connections, 10);
        assert!(!s.verbose);
        assert_eq!(s.provider, "ollama");
        assert_eq!(s.upstream, Upstream::default());
        assert_eq!(s.generation, GenerationOptions::default());
        assert_eq!(s.client_target(), "127.0.0.1:8080");
        assert_eq!(
            s.server_config().await.unwrap().bind,
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn command_line_overrides_file() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            port = 9000
            max_connections = 3
            verbose = true

            [llm]
            model = "mistral"
            temperature = 0.2
            host = "gpu-box"
            "#,
        )
        .unwrap();

        let s = Settings::resolve(&args(&["--port", "9100", "--model", "gptj"]), Some(&cfg)).unwrap();
        assert_eq!(s.port, 9100);
        assert_eq!(s.max_connections, 3);
        assert!(s.verbose);
        assert_eq!(s.generation.model, ModelKind::Gptj);
        assert_eq!(s.generation.temperature, 0.2);
        assert_eq!(s.upstream.host, "gpu-box");
        assert_eq!(s.upstream.port, 11434);
    }

    #[tokio::test]
    async fn bind_host_may_be_a_name_or_an_address() {
        let named = Settings::resolve(&args(&["--host", "localhost", "--port", "9001"]), None).unwrap();
        let bind = named.server_config().await.unwrap().bind;
        assert!(bind.ip().is_loopback());
        assert_eq!(bind.port(), 9001);
        assert_eq!(named.client_target(), "localhost:9001");

        let literal = Settings::resolve(&args(&["--host", "127.0.0.1"]), None).unwrap();
        assert_eq!(
            literal.server_config().await.unwrap().bind,
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn zero_connections_is_rejected() {
        assert!(Settings::resolve(&args(&["--max-connections", "0"]), None).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str("[server]\nprot = 1\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join("llmchat-does-not-exist/config.toml");
        assert!(Config::load_optional(path).unwrap().is_none());
    }
}
