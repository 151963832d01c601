//! Process entry point: load configuration from the environment, open the
//! storage engine, and serve the binary protocol until the process is
//! killed.

use std::process::ExitCode;
use std::sync::Arc;

use nexadb::{EngineConfig, LsmEngine, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let engine_config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid engine configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(data_dir = %engine_config.data_dir.display(), "opening storage engine");
    let engine = match LsmEngine::open(engine_config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!(error = %e, "failed to open storage engine");
            return ExitCode::FAILURE;
        }
    };

    let server_config = ServerConfig::from_env();
    if server_config.auth_token.is_none() {
        tracing::warn!("NEXADB_AUTH_TOKEN is not set; only loopback peers will be accepted");
    }

    tracing::info!(
        host = %server_config.host,
        port = server_config.port,
        "starting nexadb-server"
    );

    match nexadb::server::serve(engine, server_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server exited with an error");
            ExitCode::FAILURE
        }
    }
}
