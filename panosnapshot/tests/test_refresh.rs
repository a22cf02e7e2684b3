//! Tests du refresh contre un plan de contrôle local.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use panoapi::ControlPlaneClient;
use panosnapshot::{SnapshotEvent, SnapshotManager};
use panotransport::HttpChannel;
use std::sync::{Arc, Mutex};

type Payload = serde_json::Value;

fn payload(version: u64, items: usize) -> Payload {
    let items: Vec<_> = (0..items)
        .map(|i| {
            serde_json::json!({
                "item_id": format!("item-{}", i),
                "media_id": format!("media-{}", i),
                "media_type": "image",
                "duration_ms": 10_000,
            })
        })
        .collect();

    serde_json::json!({
        "snapshot_id": format!("snap-{}", version),
        "schedule_id": "sched-1",
        "version": version,
        "items": items,
        "media_urls": {},
    })
}

async fn snapshot_handler(State(state): State<Arc<Mutex<Payload>>>) -> Json<Payload> {
    Json(state.lock().unwrap().clone())
}

async fn start_server(initial: Payload) -> (String, Arc<Mutex<Payload>>) {
    let state = Arc::new(Mutex::new(initial));
    let app = Router::new()
        .route("/device/{id}/snapshot", get(snapshot_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base, state)
}

#[tokio::test]
async fn test_refresh_adopts_and_persists() {
    let (base, server_state) = start_server(payload(1, 2)).await;
    let dir = tempfile::tempdir().unwrap();
    let lkg_path = dir.path().join("last-snapshot.json");

    let manager = SnapshotManager::new(
        ControlPlaneClient::new(HttpChannel::new(&base, 5_000, 2).unwrap()),
        "screen-1".to_string(),
        vec![],
        lkg_path.clone(),
    );
    let mut events = manager.subscribe();

    // Premier refresh : adoption + persistance + notification
    let snapshot = manager.refresh().await.unwrap().unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.items.len(), 2);
    assert!(!manager.is_degraded());
    assert!(manager.last_sync().is_some());
    assert!(lkg_path.exists());

    match events.try_recv().unwrap() {
        SnapshotEvent::Changed(s) => assert_eq!(s.version, 1),
    }

    // Même version : pas de nouvel évènement
    manager.refresh().await.unwrap();
    assert!(events.try_recv().is_err());

    // Nouvelle version côté serveur : notification
    *server_state.lock().unwrap() = payload(2, 3);
    let snapshot = manager.refresh().await.unwrap().unwrap();
    assert_eq!(snapshot.version, 2);
    match events.try_recv().unwrap() {
        SnapshotEvent::Changed(s) => assert_eq!(s.version, 2),
    }

    // Un agent redémarré hors ligne repart du last-known-good persisté
    let offline = SnapshotManager::new(
        ControlPlaneClient::new(HttpChannel::new("http://127.0.0.1:1", 500, 1).unwrap()),
        "screen-1".to_string(),
        vec![],
        lkg_path,
    );
    let restored = offline.current().expect("last-known-good should load");
    assert_eq!(restored.version, 2);
    assert_eq!(restored.items.len(), 3);
}

#[tokio::test]
async fn test_invalid_payload_keeps_last_good() {
    let (base, server_state) = start_server(payload(1, 1)).await;
    let dir = tempfile::tempdir().unwrap();

    let manager = SnapshotManager::new(
        ControlPlaneClient::new(HttpChannel::new(&base, 5_000, 2).unwrap()),
        "screen-1".to_string(),
        vec![],
        dir.path().join("last-snapshot.json"),
    );

    manager.refresh().await.unwrap();

    // Le serveur livre ensuite une charge invalide (durée nulle)
    *server_state.lock().unwrap() = serde_json::json!({
        "snapshot_id": "snap-bad",
        "schedule_id": "sched-1",
        "version": 9,
        "items": [{
            "item_id": "item-0",
            "media_id": "media-0",
            "media_type": "image",
            "duration_ms": 0,
        }],
        "media_urls": {},
    });

    assert!(manager.refresh().await.is_err());
    assert!(manager.is_degraded());

    // Le snapshot courant reste la dernière version valide
    assert_eq!(manager.current().unwrap().version, 1);
}
