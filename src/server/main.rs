// Entry point for the ruggine-groups server
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use ruggine_groups::server::auth::{self, Authenticator, SessionAuthenticator};
use ruggine_groups::server::config::ServerConfig;
use ruggine_groups::server::connection::Server;
use ruggine_groups::server::database::Database;
use ruggine_groups::server::handlers::AppContext;
use ruggine_groups::server::mailer::LogMailer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.log_level);
    }
    env_logger::init();

    if config.enable_tls {
        info!("TLS is enabled; TLS_CERT_PATH and TLS_KEY_PATH must point to PEM files.");
    } else {
        info!("TLS is disabled; connections will be plain WebSocket.");
    }

    let database = Database::connect(&config.database_url, config.db_max_connections).await?;
    info!("Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("Database migrations completed");

    // Expired sessions are purged in the background
    let cleanup_db = database.clone();
    let every = Duration::from_secs(config.session_cleanup_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            auth::cleanup_expired_sessions(&cleanup_db).await;
        }
    });

    let authenticator: Arc<dyn Authenticator> = Arc::new(SessionAuthenticator::new(database.clone()));
    let ctx = AppContext::new(database, config, Arc::new(LogMailer));
    Server::new(ctx, authenticator).run().await
}
