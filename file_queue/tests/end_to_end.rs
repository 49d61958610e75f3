use file_queue::FileQueue;

#[tokio::test]
async fn fifo_with_commits() {
    let dir = tempfile::tempdir().unwrap();
    let queue = FileQueue::open(dir.path()).await.unwrap();

    queue.write(b"r1".to_vec()).await.unwrap();
    queue.write(b"r2".to_vec()).await.unwrap();
    queue.write(b"r3".to_vec()).await.unwrap();

    for expected in [&b"r1"[..], b"r2", b"r3"] {
        let got = queue.read().await.unwrap().unwrap();
        assert_eq!(&got[..], expected);
        queue.update_meta().await.unwrap();
    }
    assert!(queue.read().await.unwrap().is_none());
    assert!(!queue.is_data().await);

    queue.close().await;
}

#[tokio::test]
async fn read_without_commit_repeats_and_rollback_re_exposes() {
    let dir = tempfile::tempdir().unwrap();
    let queue = FileQueue::open(dir.path()).await.unwrap();

    queue.write(b"stuck".to_vec()).await.unwrap();

    let first = queue.read().await.unwrap().unwrap();
    let second = queue.read().await.unwrap().unwrap();
    assert_eq!(first, second);

    queue.rollback_meta().await.unwrap();
    let third = queue.read().await.unwrap().unwrap();
    assert_eq!(&third[..], b"stuck");

    queue.close().await;
}

#[tokio::test]
async fn pending_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let queue = FileQueue::open(dir.path()).await.unwrap();
        queue.write(b"a".to_vec()).await.unwrap();
        queue.write(b"b".to_vec()).await.unwrap();
        queue.read().await.unwrap();
        queue.update_meta().await.unwrap();
        queue.close().await;
    }

    let queue = FileQueue::open(dir.path()).await.unwrap();
    assert!(queue.is_data().await);
    assert_eq!(&queue.read().await.unwrap().unwrap()[..], b"b");
    queue.close().await;
}

#[tokio::test]
async fn closed_queue_rejects_operations() {
    let dir = tempfile::tempdir().unwrap();
    let queue = FileQueue::open(dir.path()).await.unwrap();
    queue.close().await;

    assert!(queue.write(b"late".to_vec()).await.is_err());
    assert!(queue.read().await.is_err());
    assert!(!queue.is_data().await);
}

#[tokio::test]
async fn binary_payloads_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let queue = FileQueue::open(dir.path()).await.unwrap();

    // The queue carries compressed batches; make sure arbitrary bytes and
    // embedded separators survive unharmed.
    let mut payload = b"db1 ".to_vec();
    payload.extend((0u8..=255).cycle().take(4096));
    queue.write(payload.clone()).await.unwrap();

    let got = queue.read().await.unwrap().unwrap();
    assert_eq!(&got[..], &payload[..]);
    queue.close().await;
}
