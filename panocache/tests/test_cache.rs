//! Tests d'intégration du cache média

use panocache::download::sha256_file;
use panocache::{CacheError, MediaCache, MediaStatus};
use std::path::PathBuf;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn open_cache(max_bytes: u64) -> (TempDir, MediaCache) {
    let dir = tempfile::tempdir().unwrap();
    let cache = MediaCache::open(
        dir.path(),
        max_bytes,
        reqwest::Client::new(),
        CancellationToken::new(),
    )
    .unwrap();
    (dir, cache)
}

/// Écrit un fichier source et retourne (chemin, empreinte).
async fn make_source(dir: &TempDir, name: &str, content: &[u8]) -> (PathBuf, String) {
    let path = dir.path().join(name);
    tokio::fs::write(&path, content).await.unwrap();
    let digest = sha256_file(&path).await.unwrap();
    (path, digest)
}

#[tokio::test]
async fn test_install_then_get() {
    let (dir, cache) = open_cache(1024 * 1024);
    let (source, digest) = make_source(&dir, "src.bin", b"hello signage").await;

    let installed = cache
        .install_from_file("media-1", &digest, &source)
        .await
        .unwrap();

    let got = cache.get("media-1").unwrap();
    assert_eq!(got, installed);
    assert_eq!(tokio::fs::read(&got).await.unwrap(), b"hello signage");

    let stats = cache.stats().unwrap();
    assert_eq!(stats.ready_bytes, 13);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_integrity_mismatch_quarantines() {
    let (dir, cache) = open_cache(1024 * 1024);
    let (source, _) = make_source(&dir, "src.bin", b"corrupted payload").await;

    let wrong_digest = "0".repeat(64);
    let err = cache
        .install_from_file("media-bad", &wrong_digest, &source)
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Integrity { .. }));

    // L'entrée est en quarantaine, get est un miss
    let row = cache.db().get("media-bad").unwrap().unwrap();
    assert_eq!(row.status, MediaStatus::Quarantined);
    assert!(cache.get("media-bad").is_none());

    let stats = cache.stats().unwrap();
    assert_eq!(stats.quarantined, 1);
    assert_eq!(stats.ready_bytes, 0);

    // Le blob a été déplacé, pas détruit
    assert!(dir
        .path()
        .join("objects")
        .join("quarantine")
        .join("media-bad")
        .exists());
}

#[tokio::test]
async fn test_eviction_lru_respects_pins() {
    // Budget de 30 octets : trois entrées de 10 octets tiennent juste
    let (dir, cache) = open_cache(30);

    for (i, content) in [b"AAAAAAAAAA", b"BBBBBBBBBB", b"CCCCCCCCCC"].iter().enumerate() {
        let (source, digest) = make_source(&dir, &format!("s{}.bin", i), *content).await;
        cache
            .install_from_file(&format!("media-{}", i), &digest, &source)
            .await
            .unwrap();
        // Espacer les last_used pour un ordre LRU déterministe
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // media-0 est le plus ancien mais épinglé : media-1 doit partir
    cache.pin("media-0").unwrap();

    let (source, digest) = make_source(&dir, "s3.bin", b"DDDDDDDDDD").await;
    cache
        .install_from_file("media-3", &digest, &source)
        .await
        .unwrap();

    assert!(cache.get("media-0").is_some());
    assert!(cache.get("media-1").is_none());
    assert!(cache.get("media-2").is_some());
    assert!(cache.get("media-3").is_some());
    assert!(cache.stats().unwrap().ready_bytes <= 30);
}

#[tokio::test]
async fn test_cache_full_when_pins_block_eviction() {
    let (dir, cache) = open_cache(20);

    for (i, content) in [b"AAAAAAAAAA", b"BBBBBBBBBB"].iter().enumerate() {
        let (source, digest) = make_source(&dir, &format!("s{}.bin", i), *content).await;
        cache
            .install_from_file(&format!("media-{}", i), &digest, &source)
            .await
            .unwrap();
    }
    cache.pin("media-0").unwrap();
    cache.pin("media-1").unwrap();

    let (source, digest) = make_source(&dir, "s2.bin", b"CCCCCCCCCC").await;
    let err = cache
        .install_from_file("media-2", &digest, &source)
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::CacheFull { .. }));
    // Les épinglés sont intacts, le temporaire a été supprimé
    assert!(cache.get("media-0").is_some());
    assert!(cache.get("media-1").is_some());
    assert!(!dir
        .path()
        .join("objects")
        .join(".tmp")
        .join("media-2.part")
        .exists());
}

#[tokio::test]
async fn test_install_at_exact_budget() {
    let (dir, cache) = open_cache(10);
    let (source, digest) = make_source(&dir, "s.bin", b"AAAAAAAAAA").await;

    // Exactement le budget : accepté sans éviction
    cache
        .install_from_file("media-0", &digest, &source)
        .await
        .unwrap();
    assert_eq!(cache.stats().unwrap().ready_bytes, 10);

    // Un octet de plus ne tient pas
    let (source, digest) = make_source(&dir, "s1.bin", b"B").await;
    cache.pin("media-0").unwrap();
    let err = cache
        .install_from_file("media-1", &digest, &source)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::CacheFull { .. }));
}

#[tokio::test]
async fn test_ready_entry_with_missing_file_demoted_on_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let installed = {
        let cache = MediaCache::open(
            dir.path(),
            1024,
            reqwest::Client::new(),
            CancellationToken::new(),
        )
        .unwrap();
        let (source, digest) = make_source(&dir, "s.bin", b"payload").await;
        cache
            .install_from_file("media-0", &digest, &source)
            .await
            .unwrap()
    };

    // Simuler une perte du fichier objet
    std::fs::remove_file(&installed).unwrap();

    let cache = MediaCache::open(
        dir.path(),
        1024,
        reqwest::Client::new(),
        CancellationToken::new(),
    )
    .unwrap();

    let row = cache.db().get("media-0").unwrap().unwrap();
    assert_eq!(row.status, MediaStatus::Pending);
    assert!(cache.get("media-0").is_none());
}

#[tokio::test]
async fn test_clear_without_force_keeps_pins() {
    let (dir, cache) = open_cache(1024);

    for (i, content) in [b"one", b"two"].iter().enumerate() {
        let (source, digest) = make_source(&dir, &format!("s{}.bin", i), *content).await;
        cache
            .install_from_file(&format!("media-{}", i), &digest, &source)
            .await
            .unwrap();
    }
    cache.pin("media-0").unwrap();

    cache.clear(false).unwrap();
    assert!(cache.get("media-0").is_some());
    assert!(cache.get("media-1").is_none());

    cache.clear(true).unwrap();
    assert!(cache.get("media-0").is_none());
    assert_eq!(cache.stats().unwrap().entries, 0);
}

#[tokio::test]
async fn test_verify_sweep_covers_ready_entries() {
    let (dir, cache) = open_cache(1024);

    for (i, content) in [b"one", b"two"].iter().enumerate() {
        let (source, digest) = make_source(&dir, &format!("s{}.bin", i), *content).await;
        cache
            .install_from_file(&format!("media-{}", i), &digest, &source)
            .await
            .unwrap();
    }

    // Tout est sain
    assert_eq!(cache.verify_sweep(10).await.unwrap(), 2);

    // Corrompre une entrée : le prochain passage la met en quarantaine
    std::fs::write(cache.get("media-0").unwrap(), b"tampered").unwrap();
    assert_eq!(cache.verify_sweep(10).await.unwrap(), 1);
    assert_eq!(cache.stats().unwrap().quarantined, 1);
}

#[tokio::test]
async fn test_verify_detects_on_disk_corruption() {
    let (dir, cache) = open_cache(1024);
    let (source, digest) = make_source(&dir, "s.bin", b"pristine").await;

    let installed = cache
        .install_from_file("media-0", &digest, &source)
        .await
        .unwrap();

    assert!(cache.verify("media-0").await.unwrap());

    // Corruption silencieuse sur disque
    std::fs::write(&installed, b"tampered").unwrap();

    assert!(!cache.verify("media-0").await.unwrap());
    let row = cache.db().get("media-0").unwrap().unwrap();
    assert_eq!(row.status, MediaStatus::Quarantined);
}
