use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use session_relay::{
    api,
    auth::{
        CredentialGate, Environment, HttpSecretStore, SecretStore, StaticSecretStore,
        TokenVerifier,
    },
    config::Config,
    directory::{OwnerRecord, SessionDirectory},
    logging::init_logging,
    reaper::Reaper,
    routing::HttpForwarder,
    store, RelayOptions, SessionLifecycle,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let instance_id = cfg.instance_id();
    let owner = OwnerRecord::new(instance_id.clone(), cfg.advertise_address(), cfg.internal_port)
        .with_scheme(cfg.advertise_scheme.clone());

    let store = store::open(&cfg.directory_url, cfg.directory_timeout())
        .with_context(|| format!("failed to open directory {}", cfg.directory_url))?;
    let directory = SessionDirectory::new(store);
    if let Err(error) = directory.ping().await {
        tracing::warn!(target = "session_relay::startup", error = %error, backend = %directory.describe(), "directory unreachable at startup, reaper will retry");
    }

    let gate = CredentialGate::new(build_verifier(&cfg)?, build_secret_store(&cfg));

    let mut options = RelayOptions::new(owner);
    options.send_timeout = cfg.send_timeout();
    options.fulfillment_url = cfg.fulfillment_url.clone();
    options.log_url = cfg.log_fulfillment_url.clone();
    options.dispatch_timeout = cfg.dispatch_timeout();
    options.feedback_timeout = cfg.feedback_timeout();

    let relay = Arc::new(SessionLifecycle::new(
        gate,
        directory.clone(),
        Arc::new(HttpForwarder::new(cfg.forward_timeout())),
        options,
    ));

    let reaper = Reaper::new(
        directory,
        relay.metrics.clone(),
        cfg.reap_interval(),
        cfg.session_max_age(),
        cfg.stats_every,
    )
    .spawn();

    let public_addr = format!("{}:{}", cfg.host, cfg.port);
    let public_listener = tokio::net::TcpListener::bind(&public_addr)
        .await
        .with_context(|| format!("failed to bind public listener on {public_addr}"))?;
    let internal_addr = format!("{}:{}", cfg.host, cfg.internal_port);
    let internal_listener = tokio::net::TcpListener::bind(&internal_addr)
        .await
        .with_context(|| format!("failed to bind internal listener on {internal_addr}"))?;

    tracing::info!(
        target = "session_relay::startup",
        instance = %instance_id,
        public = %public_addr,
        internal = %internal_addr,
        "relay listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let internal = {
        let mut shutdown_rx = shutdown_rx.clone();
        let router = api::internal_router(relay.clone());
        tokio::spawn(async move {
            axum::serve(internal_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        })
    };

    let mut public_shutdown = shutdown_rx;
    let public_router = api::public_router(relay.clone());
    let public = tokio::spawn(async move {
        axum::serve(public_listener, public_router)
            .with_graceful_shutdown(async move {
                let _ = public_shutdown.changed().await;
            })
            .await
    });

    wait_for_shutdown_signal().await?;
    let closed = relay.close_all("Server shutting down").await;
    tracing::info!(target = "session_relay::startup", closed, "shutting down");
    let _ = shutdown_tx.send(true);
    reaper.abort();

    for (name, server) in [("public", public), ("internal", internal)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(target = "session_relay::startup", listener = name, error = %error, "server error")
            }
            Err(error) => {
                tracing::error!(target = "session_relay::startup", listener = name, error = %error, "server task failed")
            }
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => tracing::info!(target = "session_relay::startup", "received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn build_verifier(cfg: &Config) -> Result<TokenVerifier> {
    let mut verifier = TokenVerifier::new(cfg.token_audience.clone());
    let pem_paths = [
        (Environment::Prod, &cfg.key_prod),
        (Environment::NonProd, &cfg.key_nonprod),
        (Environment::Dev, &cfg.key_dev),
    ];
    for (env, path) in pem_paths {
        let Some(path) = path else { continue };
        let pem = fs::read(path).with_context(|| format!("failed to read {env} key {path}"))?;
        verifier = verifier
            .with_rsa_pem(env, &pem)
            .with_context(|| format!("invalid RSA public key for {env} in {path}"))?;
    }
    if let Some(secret) = &cfg.local_hmac_secret {
        verifier = verifier.with_hmac_secret(Environment::Local, secret.as_bytes());
    }

    let configured = verifier.configured_environments();
    if configured.is_empty() {
        tracing::warn!(target = "session_relay::startup", "no token verification keys configured, token clients will be rejected");
    } else {
        tracing::info!(target = "session_relay::startup", environments = ?configured, "token verification keys loaded");
    }
    Ok(verifier)
}

fn build_secret_store(cfg: &Config) -> Arc<dyn SecretStore> {
    match &cfg.secret_url {
        Some(url) => Arc::new(HttpSecretStore::new(
            url.clone(),
            std::time::Duration::from_secs(cfg.secret_cache_secs),
            cfg.forward_timeout(),
        )),
        None => Arc::new(StaticSecretStore::new(cfg.shared_secret.clone())),
    }
}
