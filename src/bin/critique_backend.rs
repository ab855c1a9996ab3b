use anyhow::{Context, Result};
use critique_backend::config::AppConfig;
use critique_backend::runtime::BackendRuntime;
use critique_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,critique_backend=debug")),
        )
        .init();

    let config = AppConfig::load();
    let runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting critique backend (config via CRITIQUE_CONFIG or critique_config.toml, env vars override)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
