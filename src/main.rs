mod app;
mod cli;
mod client;
mod config;
mod provider;
mod server;
mod transport;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config::Config::default_path()?,
    };
    let cfg = config::Config::load_optional(&config_path)?;
    let settings = config::Settings::resolve(&args, cfg.as_ref())?;

    let default_level = if settings.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
    tracing::debug!(?config_path, loaded = cfg.is_some(), ?settings, "resolved settings");

    match args.cmd {
        None | Some(cli::Command::Serve) => app::cmd_serve(&settings).await,
        Some(cli::Command::Chat) => client::run(&settings.client_target()).await,
        Some(cli::Command::Ask { prompt }) => app::cmd_ask(&settings, prompt.join(" ")).await,
        Some(cli::Command::Check) => app::cmd_check(&settings).await,
    }
}
