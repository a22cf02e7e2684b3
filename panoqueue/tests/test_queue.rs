//! Tests d'intégration de la file sortante

use panoqueue::{QueueStore, RecordKind};
use tempfile::TempDir;

fn open_store(max_records: usize) -> (TempDir, QueueStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(&dir.path().join("outbound-queue.db"), max_records, 10).unwrap();
    (dir, store)
}

#[test]
fn test_fifo_within_kind() {
    let (_dir, store) = open_store(100);

    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{\"n\":1}")
        .unwrap();
    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{\"n\":2}")
        .unwrap();
    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{\"n\":3}")
        .unwrap();

    // La tête doit être le premier enfilé
    let head = store.peek_kind(RecordKind::Heartbeat).unwrap().unwrap();
    assert_eq!(head.body, "{\"n\":1}");

    store.remove(head.id).unwrap();
    let head = store.peek_kind(RecordKind::Heartbeat).unwrap().unwrap();
    assert_eq!(head.body, "{\"n\":2}");
}

#[test]
fn test_kinds_are_independent() {
    let (_dir, store) = open_store(100);

    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{}")
        .unwrap();
    store
        .enqueue(RecordKind::ProofOfPlay, "POST", "/device/proof-of-play", "{}")
        .unwrap();

    let kinds = store.pending_kinds().unwrap();
    assert_eq!(kinds.len(), 2);
    assert_eq!(store.size_of_kind(RecordKind::Heartbeat).unwrap(), 1);
    assert_eq!(store.size_of_kind(RecordKind::ProofOfPlay).unwrap(), 1);
}

#[test]
fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbound-queue.db");

    {
        let store = QueueStore::open(&path, 100, 10).unwrap();
        store
            .enqueue(RecordKind::CommandAck, "POST", "/device/d1/commands/c1/ack", "{}")
            .unwrap();
    }

    // Réouverture : l'enregistrement doit avoir survécu
    let store = QueueStore::open(&path, 100, 10).unwrap();
    assert_eq!(store.size().unwrap(), 1);
    let record = store.peek_kind(RecordKind::CommandAck).unwrap().unwrap();
    assert_eq!(record.path, "/device/d1/commands/c1/ack");
    assert_eq!(record.attempts, 0);
}

#[test]
fn test_cap_discards_oldest_of_same_kind() {
    let (_dir, store) = open_store(3);

    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{\"n\":1}")
        .unwrap();
    store
        .enqueue(RecordKind::ProofOfPlay, "POST", "/device/proof-of-play", "{\"n\":2}")
        .unwrap();
    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{\"n\":3}")
        .unwrap();

    // La file est pleine : ce heartbeat doit écarter le heartbeat n°1,
    // pas le proof-of-play
    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{\"n\":4}")
        .unwrap();

    assert_eq!(store.size().unwrap(), 3);
    assert_eq!(store.size_of_kind(RecordKind::ProofOfPlay).unwrap(), 1);

    let head = store.peek_kind(RecordKind::Heartbeat).unwrap().unwrap();
    assert_eq!(head.body, "{\"n\":3}");
}

#[test]
fn test_mark_attempt_increments() {
    let (_dir, store) = open_store(10);

    let id = store
        .enqueue(RecordKind::LogBundle, "POST", "/device/logs", "{}")
        .unwrap();

    store.mark_attempt(id).unwrap();
    store.mark_attempt(id).unwrap();

    let record = store.peek_kind(RecordKind::LogBundle).unwrap().unwrap();
    assert_eq!(record.attempts, 2);
}

#[test]
fn test_clear() {
    let (_dir, store) = open_store(10);

    store
        .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", "{}")
        .unwrap();
    store
        .enqueue(RecordKind::ProofOfPlay, "POST", "/device/proof-of-play", "{}")
        .unwrap();

    store.clear().unwrap();
    assert_eq!(store.size().unwrap(), 0);
    assert!(store.pending_kinds().unwrap().is_empty());
}
