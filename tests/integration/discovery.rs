use crate::*;

use capsule_services::{ConnectionState, ProviderRecord, Rendezvous};

const WINDOW: Duration = Duration::from_millis(500);

#[tokio::test]
async fn rendezvous_pass_connects_every_other_provider() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();
    let c = TestNode::spawn(&lookup).await.unwrap();
    for n in [&a, &b, &c] {
        n.node.discovery().advertise_once(RENDEZVOUS_KEY).await.unwrap();
    }

    let report = a
        .node
        .discovery()
        .discover_once(RENDEZVOUS_KEY, WINDOW)
        .await
        .unwrap();
    assert_eq!(report.seen, 3);
    assert_eq!(report.skipped, 1, "own record is skipped");
    assert_eq!(report.attempted, 2);
    assert_eq!(report.connected, 2);

    let directory = a.node.directory();
    assert_eq!(directory.state(&b.id()), Some(ConnectionState::Connected));
    assert_eq!(directory.state(&c.id()), Some(ConnectionState::Connected));

    // Connected peers are not dialled again
    let second = a
        .node
        .discovery()
        .discover_once(RENDEZVOUS_KEY, WINDOW)
        .await
        .unwrap();
    assert_eq!(second.attempted, 0);
    assert_eq!(second.skipped, 3);
}

#[tokio::test]
async fn dead_provider_does_not_stop_the_pass() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();
    b.node.discovery().advertise_once(RENDEZVOUS_KEY).await.unwrap();

    // A provider whose port nobody listens on any more
    let dead_addr = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let ghost = Keypair::generate().peer_id();
    lookup
        .provide(
            RENDEZVOUS_KEY,
            ProviderRecord {
                peer: ghost,
                addrs: vec![dead_addr],
            },
        )
        .await
        .unwrap();

    let report = a
        .node
        .discovery()
        .discover_once(RENDEZVOUS_KEY, WINDOW)
        .await
        .unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.connected, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(a.node.directory().state(&ghost), Some(ConnectionState::Failed));
    assert_eq!(
        a.node.directory().state(&b.id()),
        Some(ConnectionState::Connected)
    );
}

#[tokio::test]
async fn falls_back_to_the_next_address() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    let dead_addr = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let record = PeerRecord::discovered(b.id(), vec![dead_addr, b.addr]);
    let used = a.node.discovery().connect(&record).await.unwrap();
    assert_eq!(used, b.addr);
}

#[tokio::test]
async fn locally_found_peer_is_dialled_once() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    let engine = a.node.discovery();
    assert!(engine.on_peer_found(b.record()));
    assert!(!engine.on_peer_found(b.record()), "second sighting only refreshes");
    assert!(!engine.on_peer_found(a.record()), "never dials itself");

    let directory = a.node.directory().clone();
    let id = b.id();
    assert!(
        wait_until(Duration::from_secs(3), || {
            directory.state(&id) == Some(ConnectionState::Connected)
        })
        .await
    );
}

#[tokio::test]
async fn link_loss_returns_the_peer_to_discovered() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();
    let id = b.id();

    assert!(a.node.discovery().on_peer_found(b.record()));
    let directory = a.node.directory().clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            directory.state(&id) == Some(ConnectionState::Connected)
        })
        .await
    );

    drop(b);
    assert!(
        wait_until(Duration::from_secs(3), || {
            directory.state(&id) == Some(ConnectionState::Discovered)
        })
        .await,
        "closed link should be noticed"
    );
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();
    b.node.discovery().advertise_once(RENDEZVOUS_KEY).await.unwrap();

    let (stop, _) = broadcast::channel(1);
    let engine = a.node.discovery().clone();
    let rx = stop.subscribe();
    let task = tokio::spawn(async move {
        engine
            .run(RENDEZVOUS_KEY, Duration::from_millis(100), rx)
            .await
    });

    let directory = a.node.directory().clone();
    let id = b.id();
    assert!(
        wait_until(Duration::from_secs(3), || {
            directory.state(&id) == Some(ConnectionState::Connected)
        })
        .await
    );

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}
