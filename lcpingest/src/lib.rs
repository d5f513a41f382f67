//! # lcpingest: LCP encryption ingestion service
//!
//! `lcpingest` accepts EPUB and PDF publications over HTTP, encrypts them for LCP (Readium's
//! Licensed Content Protection) and registers the protected content with an LCP server, which
//! later issues licenses for it.
//!
//! ## Request flow
//!
//! ```text
//! POST /upload (multipart: file, contentid?)
//!   → storage      stream the file to <root>/uploads/<request id>/<name>
//!   → content_id   use the caller's contentid or generate a UUID
//!   → encryption   EPUB directly, PDF via a web publication package
//!   → notifier     PUT <lcp server>/contents/<contentid>
//!   ← JSON publication record
//! ```
//!
//! Encryption runs either in-process ([`encryption::engine`]) or by spawning the `lcpencrypt`
//! executable ([`encryption::external`]), which then registers the content itself and whose
//! output is relayed to the caller. See [`config`] for the settings and [`pipeline`] for the
//! stage machine.
//!
//! ## Modules
//!
//! - [`api`]: HTTP handlers and response models
//! - [`config`]: YAML + environment configuration
//! - [`content_id`]: content identifier allocation
//! - [`encryption`]: packaging and encryption
//! - [`errors`]: error taxonomy and its HTTP mapping
//! - [`notifier`]: LCP server client
//! - [`pipeline`]: request orchestration
//! - [`storage`]: upload storage
//! - [`telemetry`]: logging and trace export

pub mod api;
pub mod config;
pub mod content_id;
pub mod encryption;
pub mod errors;
pub mod notifier;
mod openapi;
pub mod pipeline;
pub mod storage;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::{
    Json, Router,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use config::EncryptionMode;
use encryption::{ContainerEngine, EncryptionInvoker, ExternalInvoker, InProcessInvoker, WebPubPackager};
use notifier::LcpServerNotifier;
use openapi::ApiDoc;
use pipeline::Pipeline;
use std::sync::Arc;
use storage::UploadStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};
use utoipa::OpenApi;

/// Multipart framing around the file part
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .pipeline(Arc::new(pipeline))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub pipeline: Arc<Pipeline>,
}

/// Build the pipeline the configuration asks for.
pub fn build_pipeline(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Pipeline> {
    let store = UploadStore::new(&config.storage.root, config.storage.max_upload_size);

    let invoker = match config.encryption.mode {
        EncryptionMode::InProcess => EncryptionInvoker::InProcess(InProcessInvoker::new(
            Arc::new(ContainerEngine::new()),
            Arc::new(WebPubPackager::new()),
            store.clone(),
        )),
        EncryptionMode::External => {
            let external = &config.encryption.external;
            let executable = external
                .executable
                .clone()
                .context("encryption.external.executable is not configured")?;
            let lcp_server = config.lcp_server.url.clone().context("lcp_server.url is not configured")?;

            EncryptionInvoker::External(
                ExternalInvoker::builder()
                    .executable(executable)
                    .timeout(external.timeout)
                    .relay(external.relay)
                    .lcp_server(lcp_server)
                    .username(config.lcp_server.username.clone())
                    .password(config.lcp_server.password.clone())
                    .output_dir(config.storage.root.clone())
                    .shutdown(shutdown)
                    .build(),
            )
        }
    };

    let notifier = LcpServerNotifier::from_config(&config.lcp_server)?;
    Ok(Pipeline::new(store, invoker, Arc::new(notifier)))
}

pub fn build_router(state: AppState) -> Router {
    // The size limit proper is enforced per chunk while the file streams to disk
    let body_limit = usize::try_from(state.config.storage.max_upload_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);
    let enable_metrics = state.config.enable_metrics;

    let mut router = Router::new()
        .route(
            "/upload",
            post(api::handlers::upload::upload_publication).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/healthz", get(|| async { "OK" }))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state);

    if enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// The HTTP server and everything it owns.
///
/// [`Application::new`] builds the pipeline and router, [`Application::serve`] runs until the
/// shutdown future resolves and then kills any encryption process still running.
pub struct Application {
    router: Router,
    config: Config,
    shutdown: CancellationToken,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting lcpingest with configuration: {:#?}", config);

        tokio::fs::create_dir_all(&config.storage.root)
            .await
            .with_context(|| format!("Failed to create storage root {}", config.storage.root.display()))?;

        let shutdown = CancellationToken::new();
        let pipeline = build_pipeline(&config, shutdown.clone())?;
        info!(
            mode = ?config.encryption.mode,
            storage_root = %config.storage.root.display(),
            "Encryption pipeline ready"
        );

        let state = AppState::builder().config(config.clone()).pipeline(Arc::new(pipeline)).build();
        let router = build_router(state);

        Ok(Self {
            router,
            config,
            shutdown,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "LCP encryption server listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        let token = self.shutdown.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                // Running encryption processes are killed so draining requests finish promptly
                token.cancel();
            })
            .await?;

        self.shutdown.cancel();
        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayPolicy;
    use crate::test_utils::{create_test_config, install_crypto_provider};
    use std::path::PathBuf;

    #[tokio::test]
    async fn healthz_reports_ok() {
        install_crypto_provider();
        let root = tempfile::tempdir().unwrap();
        let server = Application::new(create_test_config(root.path(), "http://lcp.internal:8989"))
            .await
            .unwrap()
            .into_test_server();

        let response = server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }

    #[tokio::test]
    async fn serves_openapi_document() {
        install_crypto_provider();
        let root = tempfile::tempdir().unwrap();
        let server = Application::new(create_test_config(root.path(), "http://lcp.internal:8989"))
            .await
            .unwrap()
            .into_test_server();

        let response = server.get("/openapi.json").await;
        response.assert_status_ok();
        let doc: serde_json::Value = response.json();
        assert!(doc["paths"]["/upload"].is_object());
    }

    #[tokio::test]
    async fn metrics_route_only_when_enabled() {
        install_crypto_provider();
        let root = tempfile::tempdir().unwrap();
        let server = Application::new(create_test_config(root.path(), "http://lcp.internal:8989"))
            .await
            .unwrap()
            .into_test_server();

        server.get("/internal/metrics").await.assert_status_not_found();
    }

    #[tokio::test]
    async fn creates_missing_storage_root() {
        install_crypto_provider();
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");

        Application::new(create_test_config(&nested, "http://lcp.internal:8989"))
            .await
            .unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn external_mode_builds_external_invoker() {
        install_crypto_provider();
        let root = tempfile::tempdir().unwrap();
        let mut config = create_test_config(root.path(), "http://lcp.internal:8989");
        config.encryption.mode = EncryptionMode::External;
        config.encryption.external.executable = Some(PathBuf::from("/usr/local/bin/lcpencrypt"));
        config.encryption.external.relay = RelayPolicy::BestEffort;

        let pipeline = build_pipeline(&config, CancellationToken::new()).unwrap();
        assert_eq!(pipeline.store().root(), root.path());

        config.encryption.external.executable = None;
        assert!(build_pipeline(&config, CancellationToken::new()).is_err());
    }
}
