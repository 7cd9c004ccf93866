use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::Request;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};
use url::Url;

use liverec::auth::AuthManager;
use liverec::cluster::Cluster;
use liverec::config::Config;
use liverec::route::AppState;
use liverec::scratch::ScratchStore;
use liverec::service::{Transcoder, Transcoding, Uploader, WebRtcRecorder};
use liverec::storage::FileStorage;
use liverec::store::{JobStore, PgJobStore, SessionRegistry};
use liverec::{log, rtc, signal};

#[derive(Parser)]
#[command(version, about = "WebRTC P2P video recorder")]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::parse(args.config);
    if let Some(listen) = args.listen {
        cfg.http.listen = listen;
    }
    if let Some(level) = args.log_level {
        cfg.log.level = level;
    }
    log::set(
        format!("liverec={},webrtc=error", cfg.log.level),
        cfg.log.format,
    );
    warn!("set log level: {}", cfg.log.level);
    debug!("config: {:?}", cfg);

    let cancel = CancellationToken::new();

    let scratch = ScratchStore::new(&cfg.scratch.dir)?;

    // The pipeline cannot make progress without its store; bail out early.
    let pg = PgJobStore::connect(
        &cfg.database.dsn,
        cfg.database.max_connections,
        cfg.service.id.clone(),
    )
    .await
    .context("job store unreachable")?;
    pg.init().await.context("job store schema init failed")?;
    pg.reset().await.context("job store reset failed")?;
    let store: Arc<dyn JobStore> = Arc::new(pg);

    let storage_url = Url::parse(&cfg.storage.url).context("storage.url is required")?;
    let storage = FileStorage::new(storage_url, cfg.storage.token.clone());
    let _uploader = Uploader::start(
        cancel.child_token(),
        &cfg.uploader,
        store.clone(),
        scratch.clone(),
        storage,
    );
    let transcoding = Transcoding::start(
        cancel.child_token(),
        &cfg.transcoding,
        store.clone(),
        scratch.clone(),
        Transcoder::new(),
    );

    let registry = Arc::new(SessionRegistry::new());
    let api = rtc::build_api(&cfg.rtc)?;
    let recorder = WebRtcRecorder::new(api, registry, scratch, transcoding);
    let auth = Arc::new(AuthManager::new(&cfg.auth));

    let listener = tokio::net::TcpListener::bind(&cfg.http.listen).await?;
    let addr = listener.local_addr()?;
    info!("server listening on {}", addr);

    if !cfg.service.discovery.is_empty() {
        let agent = Url::parse(&cfg.service.discovery)?;
        let cluster = Cluster::new(
            agent,
            cfg.service.id.clone(),
            addr.ip().to_string(),
            addr.port(),
        );
        cluster.start(cancel.child_token()).await?;
    }

    let state = AppState {
        recorder,
        auth,
        config: cfg.clone(),
    };
    let app = liverec::app(state)
        .layer(if cfg.http.cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                info_span!(
                    "http_request",
                    uri = ?request.uri(),
                    method = ?request.method(),
                )
            }),
        );

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let msg = signal::wait_for_stop_signal().await;
            debug!("received signal: {}", msg);
            shutdown.cancel();
        })
        .await
        .unwrap_or_else(|e| error!("application error: {e}"));

    // Stages observe the token, finish in-flight work and stop leasing.
    cancel.cancel();
    info!("server shutdown");
    Ok(())
}
