//! Tests d'intégration du drainage contre un serveur local.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use panoqueue::{DrainReport, QueueDrainer, QueueStore, RecordKind};
use panotransport::HttpChannel;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Received {
    heartbeats: Mutex<Vec<String>>,
    acks: Mutex<Vec<String>>,
}

async fn heartbeat_handler(State(state): State<Arc<Received>>, body: String) -> StatusCode {
    state.heartbeats.lock().unwrap().push(body);
    StatusCode::OK
}

async fn ack_handler(State(state): State<Arc<Received>>, body: String) -> StatusCode {
    state.acks.lock().unwrap().push(body);
    StatusCode::OK
}

/// Le serveur connaît déjà ces proof-of-play : 409.
async fn pop_conflict_handler() -> StatusCode {
    StatusCode::CONFLICT
}

async fn reject_handler() -> (StatusCode, &'static str) {
    (StatusCode::UNPROCESSABLE_ENTITY, "malformed")
}

async fn broken_handler() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn start_server() -> (String, Arc<Received>) {
    let state = Arc::new(Received::default());

    let app = Router::new()
        .route("/device/heartbeat", post(heartbeat_handler))
        .route("/device/{id}/commands/{cmd}/ack", post(ack_handler))
        .route("/device/proof-of-play", post(pop_conflict_handler))
        .route("/reject", post(reject_handler))
        .route("/broken", post(broken_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base, state)
}

fn open_queue() -> (tempfile::TempDir, Arc<QueueStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(QueueStore::open(&dir.path().join("queue.db"), 100, 3).unwrap());
    (dir, store)
}

#[tokio::test]
async fn test_drain_delivers_fifo_per_kind() {
    let (base, received) = start_server().await;
    let (_dir, store) = open_queue();

    for n in 1..=3 {
        store
            .enqueue(
                RecordKind::Heartbeat,
                "POST",
                "/device/heartbeat",
                &format!("{{\"n\":{}}}", n),
            )
            .unwrap();
    }
    store
        .enqueue(
            RecordKind::CommandAck,
            "POST",
            "/device/screen-1/commands/c1/ack",
            "{\"command_id\":\"c1\"}",
        )
        .unwrap();

    let drainer = QueueDrainer::new(store.clone(), HttpChannel::new(&base, 5_000, 2).unwrap());
    let report = drainer.drain().await.unwrap();

    assert_eq!(
        report,
        DrainReport {
            delivered: 4,
            dropped: 0,
            retained: 0
        }
    );
    assert_eq!(store.size().unwrap(), 0);

    // FIFO à l'intérieur du genre heartbeat
    let heartbeats = received.heartbeats.lock().unwrap();
    assert_eq!(
        *heartbeats,
        vec![
            "{\"n\":1}".to_string(),
            "{\"n\":2}".to_string(),
            "{\"n\":3}".to_string()
        ]
    );
    assert_eq!(received.acks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_pop_conflict_counts_as_delivered() {
    let (base, _received) = start_server().await;
    let (_dir, store) = open_queue();

    store
        .enqueue(
            RecordKind::ProofOfPlay,
            "POST",
            "/device/proof-of-play",
            "{\"events\":[]}",
        )
        .unwrap();

    let drainer = QueueDrainer::new(store.clone(), HttpChannel::new(&base, 5_000, 2).unwrap());
    let report = drainer.drain().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(store.size().unwrap(), 0);
}

#[tokio::test]
async fn test_definitive_4xx_drops_record() {
    let (base, _received) = start_server().await;
    let (_dir, store) = open_queue();

    store
        .enqueue(RecordKind::Heartbeat, "POST", "/reject", "{}")
        .unwrap();

    let drainer = QueueDrainer::new(store.clone(), HttpChannel::new(&base, 5_000, 2).unwrap());
    let report = drainer.drain().await.unwrap();

    assert_eq!(report.dropped, 1);
    assert_eq!(store.size().unwrap(), 0);
}

#[tokio::test]
async fn test_5xx_retains_with_attempt_count() {
    let (base, _received) = start_server().await;
    let (_dir, store) = open_queue();

    let id = store
        .enqueue(RecordKind::Heartbeat, "POST", "/broken", "{}")
        .unwrap();

    let drainer = QueueDrainer::new(store.clone(), HttpChannel::new(&base, 5_000, 2).unwrap());
    let report = drainer.drain().await.unwrap();

    assert_eq!(report.retained, 1);
    assert_eq!(store.size().unwrap(), 1);
    let record = store.peek_kind(RecordKind::Heartbeat).unwrap().unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn test_drain_is_idempotent() {
    let (base, received) = start_server().await;
    let (_dir, store) = open_queue();

    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{\"n\":1}")
        .unwrap();

    let drainer = QueueDrainer::new(store.clone(), HttpChannel::new(&base, 5_000, 2).unwrap());

    // Enfiler puis drainer deux fois : la seconde passe ne fait rien
    let first = drainer.drain().await.unwrap();
    let second = drainer.drain().await.unwrap();

    assert_eq!(first.delivered, 1);
    assert_eq!(second, DrainReport::default());
    assert_eq!(received.heartbeats.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_record_dropped_after_max_attempts() {
    let (base, _received) = start_server().await;
    let (_dir, store) = open_queue();

    // max_attempts = 3 ; deux passes déjà consommées
    let id = store
        .enqueue(RecordKind::Heartbeat, "POST", "/broken", "{}")
        .unwrap();
    store.mark_attempt(id).unwrap();
    store.mark_attempt(id).unwrap();

    let drainer = QueueDrainer::new(store.clone(), HttpChannel::new(&base, 5_000, 2).unwrap());
    let report = drainer.drain().await.unwrap();

    assert_eq!(report.dropped, 1);
    assert_eq!(store.size().unwrap(), 0);
}
