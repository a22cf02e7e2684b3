//! Scénario de bout en bout : premier appairage puis première lecture.
//!
//! Un plan de contrôle local appaire l'écran (code confirmé d'emblée),
//! livre un snapshot d'un seul item image et sert le média. On vérifie :
//! l'identité installée en mode propriétaire seul, le média en cache
//! avec la bonne empreinte, la présentation qui boucle, et le
//! proof-of-play spoulé dans la file sortante.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use panoapi::ControlPlaneClient;
use panocache::download::sha256_file;
use panocache::MediaCache;
use panoconfig::Config;
use panoidentity::IdentityStore;
use panoplayer::{
    ensure_paired, ControllerDeps, PlaybackController, PlayerState, PresentRequest,
    ProofOfPlayRecorder, RenderSurface,
};
use panoprefetch::{PrefetchPlanner, PrefetchSettings};
use panoqueue::{QueueDrainer, QueueStore, RecordKind};
use panoschedule::TimelineScheduler;
use panosnapshot::SnapshotManager;
use panotransport::HttpChannel;
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const MEDIA_BYTES: &[u8] = b"fake jpeg bytes for the lobby poster";

/// Surface qui mémorise chaque présentation avec son chemin média.
#[derive(Default)]
struct RecordingSurface {
    presented: Mutex<Vec<(String, Option<PathBuf>)>>,
}

#[async_trait::async_trait]
impl RenderSurface for RecordingSurface {
    async fn present(&self, request: PresentRequest) -> Result<(), String> {
        self.presented
            .lock()
            .unwrap()
            .push((request.item.item_id, request.media_path));
        Ok(())
    }
    async fn blank(&self) -> Result<(), String> {
        Ok(())
    }
    async fn show_test_pattern(&self) -> Result<(), String> {
        Ok(())
    }
    async fn show_error_slide(&self, _message: &str) -> Result<(), String> {
        Ok(())
    }
    async fn show_pairing_code(&self, _code: &str) -> Result<(), String> {
        Ok(())
    }
    async fn capture_frame(&self) -> Result<bytes::Bytes, String> {
        Ok(bytes::Bytes::new())
    }
}

fn self_signed(cn: &str) -> String {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);
    params.self_signed(&key).unwrap().pem()
}

struct PlaneState {
    media_digest: String,
    csr_seen: Mutex<Option<String>>,
}

async fn start_plane(media_digest: String) -> (String, Arc<PlaneState>) {
    let state = Arc::new(PlaneState {
        media_digest,
        csr_seen: Mutex::new(None),
    });

    async fn request_code() -> Json<serde_json::Value> {
        Json(serde_json::json!({ "pairing_code": "COLD01" }))
    }

    async fn status() -> Json<serde_json::Value> {
        // L'opérateur a déjà confirmé
        Json(serde_json::json!({ "paired": true }))
    }

    async fn complete(
        State(state): State<Arc<PlaneState>>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        *state.csr_seen.lock().unwrap() = Some(body["csr"].as_str().unwrap().to_string());
        Json(serde_json::json!({
            "device_id": "screen-42",
            "client_cert": self_signed("screen-42"),
            "ca_cert": self_signed("panosign-ca"),
        }))
    }

    async fn snapshot(State(state): State<Arc<PlaneState>>) -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "snapshot_id": "snap-1",
            "schedule_id": "sched-lobby",
            "version": 1,
            "items": [{
                "item_id": "poster",
                "media_id": "m1",
                "media_type": "image",
                "duration_ms": 400,
                "digest": state.media_digest,
            }],
            "media_urls": { "m1": "/media/m1" },
        }))
    }

    async fn media() -> &'static [u8] {
        MEDIA_BYTES
    }

    let app = Router::new()
        .route("/device-pairing/request", post(request_code))
        .route("/device-pairing/status", get(status))
        .route("/device-pairing/complete", post(complete))
        .route("/device/{id}/snapshot", get(snapshot))
        .route("/media/m1", get(media))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base, state)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cold_pair_and_first_play() {
    let dir = tempfile::tempdir().unwrap();

    // Empreinte du média, connue du snapshot
    let media_file = dir.path().join("media-src");
    tokio::fs::write(&media_file, MEDIA_BYTES).await.unwrap();
    let digest = sha256_file(&media_file).await.unwrap();

    let (base, plane) = start_plane(digest.clone()).await;

    let config = Arc::new(Config::load_config(dir.path().to_str().unwrap()).unwrap());
    config.set_base_url(&base).unwrap();

    let shutdown = CancellationToken::new();
    let recording: Arc<RecordingSurface> = Arc::new(RecordingSurface::default());
    let surface: Arc<dyn RenderSurface> = recording.clone();

    // ===== Appairage à froid =====

    let identity = IdentityStore::new(config.get_secrets_dir().unwrap());
    let pairing_api = ControlPlaneClient::new(HttpChannel::new(&base, 5_000, 2).unwrap());
    let (state_tx, _state_rx) = watch::channel(PlayerState::Boot);

    let device_id = ensure_paired(
        &pairing_api,
        &identity,
        &config,
        &surface,
        &state_tx,
        &shutdown,
    )
    .await
    .unwrap();

    assert_eq!(device_id, "screen-42");
    assert_eq!(config.get_device_id().unwrap().as_deref(), Some("screen-42"));
    // La CSR transmise est une vraie PKCS#10
    assert!(plane
        .csr_seen
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .contains("BEGIN CERTIFICATE REQUEST"));

    // Matériel installé en mode propriétaire seul
    identity.load().unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let secrets = config.get_secrets_dir().unwrap();
        for file in ["client.key", "client.crt", "ca.crt"] {
            let mode = std::fs::metadata(secrets.join(file))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o077, 0, "{} must be owner-only", file);
        }
    }

    // ===== Première lecture =====

    let api = ControlPlaneClient::new(HttpChannel::new(&base, 5_000, 2).unwrap());
    let cache_dir = config.get_cache_dir().unwrap();

    let cache = Arc::new(
        MediaCache::open(
            &cache_dir,
            config.get_cache_max_bytes().unwrap(),
            reqwest::Client::new(),
            shutdown.clone(),
        )
        .unwrap(),
    );
    let queue = Arc::new(
        QueueStore::open(&cache_dir.join("outbound-queue.db"), 100, 5).unwrap(),
    );
    let drainer = QueueDrainer::new(queue.clone(), HttpChannel::new(&base, 5_000, 2).unwrap());
    let snapshots = SnapshotManager::new(
        api,
        device_id.clone(),
        vec![],
        cache_dir.join("last-snapshot.json"),
    );
    let scheduler = TimelineScheduler::spawn(shutdown.clone());
    let pop = ProofOfPlayRecorder::new(device_id, queue.clone(), drainer);
    let (_power_tx, power_rx) = watch::channel(true);

    let controller = Arc::new(PlaybackController::new(ControllerDeps {
        surface: surface.clone(),
        cache: cache.clone(),
        snapshots: snapshots.clone(),
        scheduler: scheduler.clone(),
        pop: pop.clone(),
        power_rx,
    }));

    let planner = PrefetchPlanner::new(
        cache.clone(),
        snapshots.clone(),
        controller.position_rx(),
        PrefetchSettings {
            horizon: 3,
            concurrency: 2,
            bandwidth_mbits: 100,
        },
    );
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { planner.run(shutdown).await });
    }

    // Snapshot récupéré sur le réseau, URLs média résolues vers le plan
    let snapshot = snapshots.refresh().await.unwrap().unwrap();
    assert_eq!(snapshot.items.len(), 1);
    // Précharger explicitement : le planificateur fait pareil en tâche
    // de fond, ici on veut un cache prêt avant la première présentation
    cache
        .install("m1", &digest, &format!("{}/media/m1", base), None)
        .await
        .unwrap();

    let mut state_rx = controller.state_rx();
    {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run(shutdown).await });
    }

    // La lecture démarre
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if *state_rx.borrow() == PlayerState::PlaybackRunning {
                return;
            }
            state_rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    // L'item boucle : au moins deux présentations en ~1 s (durée 400 ms)
    tokio::time::sleep(Duration::from_millis(1100)).await;
    {
        let presented = recording.presented.lock().unwrap();
        assert!(presented.len() >= 2, "item should loop: {:?}", presented);
        let (item_id, media_path) = &presented[0];
        assert_eq!(item_id, "poster");
        let media_path = media_path.as_ref().expect("media should come from cache");
        assert_eq!(std::fs::read(media_path).unwrap(), MEDIA_BYTES);
    }

    // L'entrée du cache est prête et hash à l'empreinte attendue
    let cached = cache.get("m1").unwrap();
    assert_eq!(sha256_file(&cached).await.unwrap(), digest);

    // Le jitter observé reste sous le seuil nominal
    let stats = scheduler.stats();
    assert!(stats.samples >= 2);
    assert!(stats.p95_ms <= 100.0, "p95 jitter {} ms", stats.p95_ms);

    // Proof-of-play : les fins de présentation partent dans la file
    pop.flush();
    assert!(queue.size_of_kind(RecordKind::ProofOfPlay).unwrap() >= 1);

    shutdown.cancel();
}
