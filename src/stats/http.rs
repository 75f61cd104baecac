use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Tables;

/// Shared state for axum handlers.
struct AppState {
    tables: Arc<Mutex<Tables>>,
}

fn router(tables: Arc<Mutex<Tables>>) -> Router {
    Router::new()
        .route("/", get(snapshot_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(AppState { tables }))
}

pub(super) fn serve(
    listener: TcpListener,
    tables: Arc<Mutex<Tables>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let app = router(tables);

    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "stats server started");
        }

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "stats server error");
        }
    })
}

/// GET / - latest snapshot as `{component: {counter: int}}`.
async fn snapshot_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.tables.lock().published.clone();
    Json(snapshot)
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr)
            .await
            .expect("connect");
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.expect("write request");

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.expect("read response");
        String::from_utf8(buf).expect("utf8 response")
    }

    #[tokio::test]
    async fn test_serves_snapshot_and_healthz() {
        let tables = Arc::new(Mutex::new(Tables::default()));
        {
            let mut t = tables.lock();
            t.published
                .entry("MetricRouter".to_string())
                .or_default()
                .insert("forwarded".to_string(), 12);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let handle = serve(listener, Arc::clone(&tables), cancel.clone());

        let body = get(addr, "/").await;
        assert!(body.starts_with("HTTP/1.1 200"), "response: {body}");
        assert!(body.contains(r#"{"MetricRouter":{"forwarded":12}}"#), "response: {body}");

        let body = get(addr, "/healthz").await;
        assert!(body.ends_with("ok"), "response: {body}");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server stops")
            .expect("server task");
    }
}
