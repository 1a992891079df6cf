use crate::*;

use capsule_core::Digest;
use capsule_services::{DiskLookup, NodeError, PublishOutcome, StorageError};
use futures::StreamExt;

/// Two nodes publish identical content at the same time.
#[tokio::test]
async fn concurrent_identical_publish_converges() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    let data = "the same bytes from two places";
    let (ra, rb) = tokio::join!(a.node.share(data, "tok"), b.node.share(data, "tok"));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.digest, rb.digest);
    assert_eq!(ra.digest, Digest::of(data.as_bytes()));
    assert!(
        !(ra.deduplicated && rb.deduplicated),
        "at least one publish must have stored the value"
    );

    for node in [&a.node, &b.node] {
        assert_eq!(node.fetch(&ra.digest).await.unwrap(), data);
    }
    let entry = lookup.entry(&ra.digest.to_hex()).unwrap();
    assert_eq!(entry.value, data);
}

/// Stores on one host share a disk lookup root and race on the same capsule.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_publish_over_a_shared_disk_root() {
    let root = std::env::temp_dir().join(format!("capsule-it-disk-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    let stores = [
        ContentCapsuleStore::new(Arc::new(DiskLookup::new(&root).unwrap()), 4096),
        ContentCapsuleStore::new(Arc::new(DiskLookup::new(&root).unwrap()), 4096),
    ];

    for round in 0..20u8 {
        let payload = vec![round; 256 * 1024];
        let digest = Digest::of(&payload);

        let mut racers = tokio::task::JoinSet::new();
        for i in 0..8 {
            let store = stores[i % 2].clone();
            let payload = payload.clone();
            racers.spawn(async move {
                let capsule = store.capsulize(payload, "tok", false)?;
                let outcome = store.publish(&capsule).await?;
                let fetched = store.fetch(&capsule.hash).await?;
                Ok::<_, StorageError>((outcome, fetched))
            });
        }

        let mut stored = 0;
        while let Some(joined) = racers.join_next().await {
            let (outcome, fetched) = joined.unwrap().unwrap();
            assert_eq!(fetched.len(), payload.len(), "round {round}");
            assert_eq!(Digest::of(&fetched), digest);
            if outcome == PublishOutcome::Stored {
                stored += 1;
            }
        }
        assert!(stored >= 1, "round {round}: nobody stored the value");
    }

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn content_shared_by_one_node_is_fetchable_from_another() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    let shared = a.node.share("aaabbbccc", "tok1").await.unwrap();
    assert!(!shared.deduplicated);
    assert_eq!(shared.origin, a.id());
    assert_eq!(shared.size, 9);

    // Publishing again from the other node finds it already present
    let again = b.node.share("aaabbbccc", "tok2").await.unwrap();
    assert!(again.deduplicated);
    assert_eq!(b.node.fetch(&shared.digest).await.unwrap(), "aaabbbccc");

    let contributor = lookup.entry(&shared.digest.to_hex()).unwrap().contributor;
    assert_eq!(contributor, Some(a.id()));
}

#[tokio::test]
async fn fetch_of_unknown_digest_is_not_found() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let digest = Digest::of(b"never shared");
    assert!(matches!(
        a.node.fetch(&digest).await,
        Err(NodeError::Storage(StorageError::NotFound(d))) if d == digest
    ));
}

#[tokio::test]
async fn shares_are_announced_to_content_subscribers() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let mut first = a.node.announcements().await.unwrap();
    let mut second = a.node.announcements().await.unwrap();

    let one = a.node.share("text:first", "tok").await.unwrap();
    let two = a.node.share(vec![0u8, 1, 2, 3, 4], "tok").await.unwrap();

    for stream in [&mut first, &mut second] {
        let got: Vec<_> = tokio::time::timeout(Duration::from_secs(1), stream.take(2).collect())
            .await
            .unwrap();
        assert_eq!(got, vec![one.clone(), two.clone()]);
    }
}

#[tokio::test]
async fn lookup_outage_fails_the_share_without_announcing() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let mut announcements = a.node.announcements().await.unwrap();

    lookup.set_reachable(false);
    assert!(matches!(
        a.node.share("lost", "tok").await,
        Err(NodeError::Storage(StorageError::Lookup(_)))
    ));
    lookup.set_reachable(true);

    let ok = a.node.share("kept", "tok").await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), announcements.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next, ok);
}
