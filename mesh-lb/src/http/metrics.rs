use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State as AxumState,
    response::{IntoResponse, Response},
    routing::get,
};
use http::{StatusCode, header};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Result, http::shutdown};

#[derive(Clone)]
pub(crate) struct State {
    ready: CancellationToken,
}

impl State {
    pub fn new(token: CancellationToken) -> Self {
        Self { ready: token }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let Ok(registry) = crate::metrics::REGISTRY.read() else {
            warn!("metrics registry lock poisoned");
            return buffer;
        };
        match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
            Ok(_) => buffer,
            Err(_) => "".into(),
        }
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Readiness::Ready => (StatusCode::OK, "Ok"),
            Readiness::NotReady => (StatusCode::INTERNAL_SERVER_ERROR, "NotReady"),
        };
        (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metrics::ReconcileMetrics;

    #[test]
    fn test_ready_after_token_cancelled() {
        let token = CancellationToken::new();
        let state = State::new(token.clone());
        assert_eq!(state.ready(), Readiness::NotReady);
        assert_eq!(
            state.ready().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        token.cancel();
        assert_eq!(state.ready(), Readiness::Ready);
        assert_eq!(state.ready().into_response().status(), StatusCode::OK);
    }

    #[test]
    fn test_metrics_are_encoded() -> crate::Result<()> {
        let metrics = ReconcileMetrics::new()?;
        drop(metrics.count_and_measure("update"));

        let body = State::new(CancellationToken::new()).metrics();
        assert!(body.contains("mesh_lb_reconcile_runs_total{operation=\"update\"}"));
        assert!(body.contains("mesh_lb_reconcile_duration_seconds_count"));
        Ok(())
    }
}
