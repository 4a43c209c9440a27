pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::AnalysisConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::BackgroundRunner;
use crate::core::store::Store;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Store,
    pub(crate) config: Arc<AnalysisConfig>,
    pub(crate) runner: BackgroundRunner,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
}

impl AppState {
    pub(crate) fn new(
        store: Store,
        config: Arc<AnalysisConfig>,
        runner: BackgroundRunner,
        log_tx: tokio::sync::broadcast::Sender<String>,
    ) -> Self {
        Self {
            store,
            config,
            runner,
            log_tx,
        }
    }
}

pub struct ApiServer {
    state: AppState,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub(crate) fn new(state: AppState) -> Self {
        Self {
            state,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line.trim_end())),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

// --- Lifecycle ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        // A taken port fails startup.
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = router::build_api_router(self.state.clone());
        let shutdown = self.shutdown.clone();

        self.handle = Some(tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server shutting down...");
        self.shutdown.cancel();
        if let Some(mut handle) = self.handle.take() {
            // Open log streams never finish on their own.
            if tokio::time::timeout(std::time::Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        Ok(())
    }
}
