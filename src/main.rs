use std::sync::Arc;

use tracing::{error, info};

use kiro_relay::auth::{CredentialStore, TokenPool};
use kiro_relay::proxy::server::{self, AppState};

fn resolve_port() -> u16 {
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse() {
            return port;
        }
        error!("PORT is not a valid port number: {}", port);
    }
    if let Some(arg) = std::env::args().nth(1) {
        if let Ok(port) = arg.parse() {
            return port;
        }
    }
    8080
}

#[tokio::main]
async fn main() {
    kiro_relay::logger::init();

    // The client-facing bearer secret has no default on purpose.
    let client_token = match std::env::var("KIRO_CLIENT_TOKEN") {
        Ok(token) if !token.trim().is_empty() => token,
        _ => {
            error!("KIRO_CLIENT_TOKEN is not set");
            error!("set a strong random secret, e.g. KIRO_CLIENT_TOKEN=$(openssl rand -hex 32)");
            std::process::exit(1);
        }
    };

    let config_path = std::env::var("AUTH_CONFIG_FILE")
        .unwrap_or_else(|_| "./auth_config.json".to_string());
    let store = Arc::new(CredentialStore::load(&config_path));
    if store.runtime_credentials().is_empty() {
        error!("no usable upstream credential found");
        error!(
            "add one to {} or set KIRO_AUTH_TOKEN='[{{\"auth\":\"Social\",\"refreshToken\":\"...\"}}]'",
            config_path
        );
        std::process::exit(1);
    }

    let client = match reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build http client: {}", e);
            std::process::exit(1);
        }
    };

    let pool = Arc::new(TokenPool::new(store.clone(), client.clone()));
    let state = AppState {
        store,
        pool,
        client,
        client_token: Arc::new(client_token),
    };

    let port = resolve_port();
    info!(port, config = %config_path, "starting kiro-relay");

    if let Err(e) = server::run(port, state).await {
        error!(port, "server failed: {}", e);
        std::process::exit(1);
    }
    info!("shut down");
}
