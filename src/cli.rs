use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chat server that relays messages to a local LLM service
#[derive(Debug, Parser)]
#[command(name = "llmchat")]
#[command(version)]
#[command(about = "Chat server that relays messages to a local LLM service", long_about = None)]
pub struct Args {
    /// Configuration file (default: <config dir>/config.toml)
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Server host (bind address for `serve`, target for `chat`)
    #[arg(long = "host", global = true)]
    pub host: Option<String>,

    /// Server port
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<u16>,

    /// Maximum simultaneous client connections
    #[arg(long = "max-connections", global = true)]
    pub max_connections: Option<usize>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Provider: "ollama" or "stub"
    #[arg(long = "provider", global = true)]
    pub provider: Option<String>,

    /// Model type (llama, mistral, gptj, custom)
    #[arg(short = 'm', long = "model", global = true)]
    pub model: Option<String>,

    /// Model name used with the custom model type
    #[arg(long = "model-path", global = true)]
    pub model_path: Option<String>,

    /// Temperature for generation
    #[arg(long = "temperature", global = true)]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate
    #[arg(long = "max-tokens", global = true)]
    pub max_tokens: Option<u32>,

    /// Context size for the LLM
    #[arg(long = "context-size", global = true)]
    pub context_size: Option<u32>,

    /// Host of the upstream LLM service
    #[arg(long = "upstream-host", global = true)]
    pub upstream_host: Option<String>,

    /// Port of the upstream LLM service
    #[arg(long = "upstream-port", global = true)]
    pub upstream_port: Option<u16>,

    #[command(subcommand)]
    pub cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the chat server (default)
    Serve,

    /// Connect to a chat server and chat from the terminal
    Chat,

    /// Send one prompt to the LLM and stream the answer to stdout
    Ask {
        /// Prompt text
        #[arg(value_name = "PROMPT", required = true)]
        prompt: Vec<String>,
    },

    /// Check that the upstream LLM service is reachable and list its models
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn global_options_follow_subcommand() {
        let args = Args::parse_from(["llmchat", "chat", "--port", "9000", "--host", "10.0.0.2"]);
        assert!(matches!(args.cmd, Some(Command::Chat)));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.host.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn ask_collects_prompt_words() {
        let args = Args::parse_from(["llmchat", "ask", "why", "is", "the", "sky", "blue"]);
        match args.cmd {
            Some(Command::Ask { prompt }) => assert_eq!(prompt.join(" "), "why is the sky blue"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
