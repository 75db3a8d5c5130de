//! l8e-harbor API Gateway Server
//!
//! Entry point for the reverse proxy data plane: loads configuration,
//! constructs the configured Route Store driver, wires up the
//! `GatewayContext`, and binds one actix-web listener per configured entry.

use actix_web::{web, App, HttpServer};
use l8e_harbor_core::config::{GatewayConfig, RouteStoreConfig, TlsListenerConfig};
use l8e_harbor_core::context::GatewayContext;
use l8e_harbor_core::handlers;
use l8e_harbor_core::logging::configure_logger;
use l8e_harbor_core::route_store::{FileSnapshotRouteStore, InMemoryRouteStore, RouteStoreDriver};
use log::{error, info};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::signal;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Installed once per process; any listener that enables tls reuses it.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = std::env::var("L8E_CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = match std::path::Path::new(&config_path).exists() {
        true => match GatewayConfig::load_from_path(std::path::Path::new(&config_path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load configuration from {config_path}: {e}");
                std::process::exit(1);
            }
        },
        false => GatewayConfig::default(),
    };

    configure_logger(&config.log_level);

    if let Err(e) = config.validate() {
        error!("configuration invalid: {e}");
        std::process::exit(1);
    }
    info!("l8e-harbor gateway starting, {} listener(s) configured", config.listeners.len());

    let route_store: Arc<dyn RouteStoreDriver> = match build_route_store(&config.route_store).await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to initialize route store: {e}");
            std::process::exit(3);
        }
    };

    let ctx = match GatewayContext::with_resource_limits(
        route_store,
        config.max_in_flight_requests,
        config.connection_pool_ceiling_per_backend,
        config.connection_pool_wait_ms,
    ) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to compile initial router: {e}");
            std::process::exit(3);
        }
    };

    tokio::spawn(Arc::clone(&ctx).run_snapshot_sync());

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(Arc::clone(&ctx)))
            .app_data(web::PayloadConfig::new(64 * 1024 * 1024))
            .route("/health", web::get().to(handlers::liveness))
            .route("/ready", web::get().to(handlers::readiness))
            .route("/health/detailed", web::get().to(handlers::detailed_health))
            .default_service(web::route().to(handlers::proxy))
    });

    for listener in &config.listeners {
        server = match &listener.tls {
            Some(tls) => {
                let rustls_config = match build_rustls_config(tls) {
                    Ok(c) => c,
                    Err(e) => {
                        error!("failed to load tls material for {}:{}: {e}", listener.host, listener.port);
                        std::process::exit(2);
                    }
                };
                match server.bind_rustls_0_23((listener.host.as_str(), listener.port), rustls_config) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to bind {}:{} (tls): {e}", listener.host, listener.port);
                        std::process::exit(2);
                    }
                }
            }
            None => match server.bind((listener.host.as_str(), listener.port)) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to bind {}:{}: {e}", listener.host, listener.port);
                    std::process::exit(2);
                }
            },
        };
        info!(
            "listening on {}:{}{}",
            listener.host,
            listener.port,
            if listener.tls.is_some() { " (tls)" } else { "" }
        );
    }

    let running = server.run();

    tokio::select! {
        result = running => {
            match result {
                Ok(_) => info!("server stopped"),
                Err(e) => error!("server error: {e}"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Builds a server-side rustls config from a listener's configured cert/key
/// pair. When `client_ca_path` is set, requires and verifies client
/// certificates against that CA bundle (mTLS); otherwise no client auth.
fn build_rustls_config(tls: &TlsListenerConfig) -> std::io::Result<rustls::ServerConfig> {
    let cert_chain = load_certs(&tls.cert_path)?;
    let private_key = load_private_key(&tls.key_path)?;

    let config_builder = rustls::ServerConfig::builder();
    let config = match &tls.client_ca_path {
        Some(ca_path) => {
            let ca_certs = load_certs(ca_path)?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in ca_certs {
                roots
                    .add(cert)
                    .map_err(|e| std::io::Error::other(format!("invalid client ca cert: {e}")))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| std::io::Error::other(format!("failed to build client verifier: {e}")))?;
            config_builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, private_key)
                .map_err(|e| std::io::Error::other(format!("invalid server cert/key: {e}")))?
        }
        None => config_builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| std::io::Error::other(format!("invalid server cert/key: {e}")))?,
    };

    Ok(config)
}

fn load_certs(path: &std::path::Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect()
}

fn load_private_key(path: &std::path::Path) -> std::io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| std::io::Error::other(format!("no private key found in {}", path.display())))
}

async fn build_route_store(cfg: &RouteStoreConfig) -> Result<Arc<dyn RouteStoreDriver>, String> {
    match cfg {
        RouteStoreConfig::Memory => Ok(Arc::new(InMemoryRouteStore::empty())),
        RouteStoreConfig::FileSnapshot { path, persist_interval_ms } => {
            let store = Arc::new(
                FileSnapshotRouteStore::open(path.clone())
                    .await
                    .map_err(|e| e.to_string())?,
            );
            store.spawn_background_tasks(std::time::Duration::from_millis(*persist_interval_ms));
            Ok(store)
        }
    }
}
