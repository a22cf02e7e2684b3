//! Tests d'intégration du téléchargement contre un serveur local.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use panocache::download::sha256_file;
use panocache::{CacheError, MediaCache, MediaStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PAYLOAD: &[u8] = b"0123456789abcdef0123456789abcdef";

#[derive(Default)]
struct ServerState {
    hits: AtomicU32,
}

async fn media_handler(State(state): State<Arc<ServerState>>) -> (HeaderMap, &'static [u8]) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    // Simuler un serveur un peu lent pour laisser les appels
    // concurrents se chevaucher
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, "\"v1\"".parse().unwrap());
    (headers, PAYLOAD)
}

async fn missing_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn start_server() -> (String, Arc<ServerState>) {
    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/media/blob", get(media_handler))
        .route("/media/missing", get(missing_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base, state)
}

fn open_cache(max_bytes: u64) -> (TempDir, Arc<MediaCache>) {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        MediaCache::open(
            dir.path(),
            max_bytes,
            reqwest::Client::new(),
            CancellationToken::new(),
        )
        .unwrap(),
    );
    (dir, cache)
}

async fn payload_digest() -> String {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("p");
    tokio::fs::write(&path, PAYLOAD).await.unwrap();
    sha256_file(&path).await.unwrap()
}

#[tokio::test]
async fn test_install_over_http() {
    let (base, state) = start_server().await;
    let (_dir, cache) = open_cache(1024);
    let digest = payload_digest().await;

    let path = cache
        .install("blob-1", &digest, &format!("{}/media/blob", base), None)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&path).await.unwrap(), PAYLOAD);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    // L'entity tag du serveur est retenu pour les reprises
    let row = cache.db().get("blob-1").unwrap().unwrap();
    assert_eq!(row.status, MediaStatus::Ready);
    assert_eq!(row.etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn test_concurrent_installs_share_one_download() {
    let (base, state) = start_server().await;
    let (_dir, cache) = open_cache(1024);
    let digest = payload_digest().await;
    let url = format!("{}/media/blob", base);

    // Deux appels simultanés pour le même media id
    let first = {
        let cache = cache.clone();
        let digest = digest.clone();
        let url = url.clone();
        tokio::spawn(async move { cache.install("blob-1", &digest, &url, None).await })
    };
    let second = {
        let cache = cache.clone();
        let digest = digest.clone();
        let url = url.clone();
        tokio::spawn(async move { cache.install("blob-1", &digest, &url, None).await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first, second);
    // Un seul téléchargement a eu lieu
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_integrity_mismatch_quarantines() {
    let (base, _state) = start_server().await;
    let (_dir, cache) = open_cache(1024);

    let err = cache
        .install(
            "blob-bad",
            &"0".repeat(64),
            &format!("{}/media/blob", base),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Integrity { .. }));
    let row = cache.db().get("blob-bad").unwrap().unwrap();
    assert_eq!(row.status, MediaStatus::Quarantined);
}

#[tokio::test]
async fn test_http_error_marks_entry_errored() {
    let (base, _state) = start_server().await;
    let (_dir, cache) = open_cache(1024);

    let err = cache
        .install(
            "blob-404",
            &"0".repeat(64),
            &format!("{}/media/missing", base),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Download { .. }));
    let row = cache.db().get("blob-404").unwrap().unwrap();
    assert_eq!(row.status, MediaStatus::Error);
    assert!(cache.get("blob-404").is_none());
}
