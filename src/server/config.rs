use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub log_level: String,
    pub auth_timeout_secs: u64,
    pub event_buffer: usize,        // per-connection event queue; full queues drop events
    pub invite_base_url: String,
    pub session_cleanup_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            database_url: "sqlite:data/ruggine_groups.db".to_string(),
            db_max_connections: 5,
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            log_level: "info".to_string(),
            auth_timeout_secs: 30,
            event_buffer: 64,
            invite_base_url: "http://localhost:5001/groups".to_string(),
            session_cleanup_secs: 600,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            host: env::var("SERVER_HOST").unwrap_or(defaults.host),
            port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(defaults.port),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: env::var("DB_MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.db_max_connections),
            enable_tls: env::var("ENABLE_TLS").map(|v| v == "true" || v == "1").unwrap_or(defaults.enable_tls),
            tls_cert_path: env::var("TLS_CERT_PATH").ok(),
            tls_key_path: env::var("TLS_KEY_PATH").ok(),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            auth_timeout_secs: env::var("AUTH_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.auth_timeout_secs),
            event_buffer: env::var("EVENT_BUFFER").ok().and_then(|v| v.parse().ok()).filter(|n: &usize| *n > 0).unwrap_or(defaults.event_buffer),
            invite_base_url: env::var("INVITE_BASE_URL").unwrap_or(defaults.invite_base_url),
            session_cleanup_secs: env::var("SESSION_CLEANUP_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.session_cleanup_secs),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
