use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};

// Optional TLS
use rustls::ServerConfig as RustlsConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

use crate::server::auth::Authenticator;
use crate::server::handlers::AppContext;
use crate::server::websocket;

pub struct Server {
    pub ctx: AppContext,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Server {
    pub fn new(ctx: AppContext, authenticator: Arc<dyn Authenticator>) -> Self {
        Self { ctx, authenticator }
    }

    /// Builds the TLS acceptor from the configured certificate and key, if TLS is enabled.
    fn setup_tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        let config = &self.ctx.config;
        if !config.enable_tls {
            info!("[TLS] TLS disabled in configuration");
            return Ok(None);
        }

        let cert_path = config
            .tls_cert_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("TLS_CERT_PATH must be set when ENABLE_TLS is on"))?;
        let key_path = config
            .tls_key_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("TLS_KEY_PATH must be set when ENABLE_TLS is on"))?;

        info!("[TLS] Loading certificate from: {}", cert_path);
        let cert_file = File::open(cert_path)
            .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", cert_path, e))?;
        let cert_chain = certs(&mut StdBufReader::new(cert_file))?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();
        if cert_chain.is_empty() {
            return Err(anyhow::anyhow!("No certificates found in {}", cert_path));
        }

        info!("[TLS] Loading private key from: {}", key_path);
        let key_file = File::open(key_path)
            .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", key_path, e))?;
        // PKCS8 first, then RSA
        let mut keys = pkcs8_private_keys(&mut StdBufReader::new(key_file))?;
        if keys.is_empty() {
            keys = rsa_private_keys(&mut StdBufReader::new(File::open(key_path)?))?;
        }
        if keys.is_empty() {
            return Err(anyhow::anyhow!("No private keys found in {}", key_path));
        }

        let rustls_cfg = RustlsConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, rustls::PrivateKey(keys.remove(0)))
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        info!("[TLS] TLS configuration successful");
        Ok(Some(TlsAcceptor::from(Arc::new(rustls_cfg))))
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.ctx.config.bind_addr();
        let tls = self.setup_tls_acceptor()?;
        let listener = TcpListener::bind(&addr).await?;
        info!("[SERVER] Listening on {} ({})", addr, if tls.is_some() { "wss" } else { "ws" });

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[SERVER] Accept failed: {}", e);
                    continue;
                }
            };
            let ctx = self.ctx.clone();
            let authenticator = self.authenticator.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, tls, ctx, authenticator, peer.to_string()).await {
                    error!("[SERVER] Connection {} ended with error: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    ctx: AppContext,
    authenticator: Arc<dyn Authenticator>,
    peer: String,
) -> anyhow::Result<()> {
    info!("[SERVER] New connection from {}", peer);
    match tls {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            let ws = tokio_tungstenite::accept_async(tls_stream).await?;
            websocket::serve_connection(ws, ctx, authenticator, peer).await
        }
        None => {
            let ws = tokio_tungstenite::accept_async(stream).await?;
            websocket::serve_connection(ws, ctx, authenticator, peer).await
        }
    }
}
