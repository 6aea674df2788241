use std::path::PathBuf;
use std::process::ExitCode;

use scintilla::config::Config;
use scintilla::gateway::{self, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().expect("default filter"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("scintilla: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config_path = std::env::var("SCINTILLA_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let pool = scintilla::db::connect(&config.database.url).await?;
    let state = AppState::new(pool, config.providers.clone(), config.broker.clone());

    gateway::serve(&config.server, state).await
}
