//! Tests d'intégration du canal HTTP contre un serveur local.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use panotransport::{HttpChannel, TransportError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ServerState {
    hits: AtomicU32,
}

async fn ok_handler() -> &'static str {
    r#"{"ok":true}"#
}

/// Échoue deux fois en 500 puis répond 200.
async fn flaky_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, &'static str) {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    if hit < 2 {
        (StatusCode::INTERNAL_SERVER_ERROR, "try again")
    } else {
        (StatusCode::OK, r#"{"ok":true}"#)
    }
}

async fn reject_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, &'static str) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::BAD_REQUEST, "bad body")
}

/// 429 avec Retry-After: 1 au premier passage, puis 200.
async fn rate_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, HeaderMap, &'static str) {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    let mut headers = HeaderMap::new();
    if hit == 0 {
        headers.insert("retry-after", "1".parse().unwrap());
        (StatusCode::TOO_MANY_REQUESTS, headers, "slow down")
    } else {
        (StatusCode::OK, headers, r#"{"ok":true}"#)
    }
}

async fn start_server() -> (String, Arc<ServerState>) {
    let state = Arc::new(ServerState::default());

    let app = Router::new()
        .route("/ok", get(ok_handler))
        .route("/flaky", get(flaky_handler))
        .route("/reject", post(reject_handler))
        .route("/rate", get(rate_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base, state)
}

#[tokio::test]
async fn test_success_returns_body() {
    let (base, _state) = start_server().await;
    let channel = HttpChannel::new(&base, 5_000, 3).unwrap();

    let response = channel
        .request::<()>(reqwest::Method::GET, "/ok", None)
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, r#"{"ok":true}"#);
}

#[tokio::test]
async fn test_5xx_is_retried_until_success() {
    let (base, state) = start_server().await;
    let channel = HttpChannel::new(&base, 5_000, 5).unwrap();

    let response = channel
        .request::<()>(reqwest::Method::GET, "/flaky", None)
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_4xx_is_not_retried() {
    let (base, state) = start_server().await;
    let channel = HttpChannel::new(&base, 5_000, 5).unwrap();

    let err = channel
        .request(
            reqwest::Method::POST,
            "/reject",
            Some(&serde_json::json!({"x": 1})),
        )
        .await
        .unwrap_err();

    match err {
        TransportError::Rejected { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad body");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // Un seul passage serveur : pas de retry sur 4xx
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_429_honours_retry_after() {
    let (base, state) = start_server().await;
    let channel = HttpChannel::new(&base, 5_000, 3).unwrap();

    let started = std::time::Instant::now();
    let response = channel
        .request::<()>(reqwest::Method::GET, "/rate", None)
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    // Le canal a respecté l'indication d'une seconde
    assert!(started.elapsed() >= std::time::Duration::from_millis(900));
}

#[tokio::test]
async fn test_retries_exhausted_reports_last_status() {
    // Aucune route : le serveur répond 404, immédiatement rendu
    let (base, _state) = start_server().await;
    let channel = HttpChannel::new(&base, 5_000, 2).unwrap();

    let err = channel
        .request::<()>(reqwest::Method::GET, "/missing", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Rejected { status: 404, .. }));
}

#[tokio::test]
async fn test_transport_failure_exhausts_retries() {
    // Port fermé : échec transport, retenté puis épuisé
    let channel = HttpChannel::new("http://127.0.0.1:1", 500, 2).unwrap();

    let err = channel
        .request::<()>(reqwest::Method::GET, "/ok", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::RetriesExhausted { attempts: 2, .. }
    ));
}

#[tokio::test]
async fn test_probe() {
    let (base, _state) = start_server().await;
    let channel = HttpChannel::new(&base, 5_000, 1).unwrap();
    assert!(channel.probe().await);

    let dead = HttpChannel::new("http://127.0.0.1:1", 500, 1).unwrap();
    assert!(!dead.probe().await);
}
