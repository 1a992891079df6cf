use crate::*;

use capsule_services::{FailReason, NodeError, SessionState, SignalingError};

fn opts(relay: &MemoryRelay, answer_timeout: Duration) -> SignalingOpts {
    SignalingOpts {
        relay: relay.clone(),
        answer_timeout,
    }
}

#[tokio::test]
async fn offer_and_answer_connect_both_sides() {
    let lookup = MemoryLookup::new();
    let relay = MemoryRelay::new();
    let a = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_secs(2)))
        .await
        .unwrap();
    let b = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_secs(2)))
        .await
        .unwrap();

    let session = a.node.negotiate(b.id()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            a.node.session_state(&session) == Some(SessionState::Connected)
        })
        .await,
        "offerer state: {:?}",
        a.node.session_state(&session)
    );
    assert!(
        wait_until(Duration::from_secs(3), || {
            b.node.session_state(&session) == Some(SessionState::Connected)
        })
        .await,
        "answerer state: {:?}",
        b.node.session_state(&session)
    );
}

#[tokio::test]
async fn unanswered_offer_times_out() {
    let lookup = MemoryLookup::new();
    let relay = MemoryRelay::new();
    let a = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_millis(200)))
        .await
        .unwrap();
    // Known to the relay as an address only; nobody answers for it
    let silent = Keypair::generate().peer_id();

    let session = a.node.negotiate(silent).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            a.node.session_state(&session) == Some(SessionState::Failed(FailReason::TimedOut))
        })
        .await,
        "state: {:?}",
        a.node.session_state(&session)
    );
    assert!(
        wait_until(Duration::from_secs(1), || relay.subscription_count() == 0).await,
        "terminal session released its subscription"
    );
}

#[tokio::test]
async fn concurrent_negotiations_get_distinct_sessions() {
    let lookup = MemoryLookup::new();
    let relay = MemoryRelay::new();
    let a = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_secs(2)))
        .await
        .unwrap();
    let b = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_secs(2)))
        .await
        .unwrap();
    let c = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_secs(2)))
        .await
        .unwrap();

    let (to_b, to_c) = tokio::join!(a.node.negotiate(b.id()), a.node.negotiate(c.id()));
    let (to_b, to_c) = (to_b.unwrap(), to_c.unwrap());
    assert_ne!(to_b, to_c);

    for (session, remote) in [(&to_b, &b), (&to_c, &c)] {
        assert!(
            wait_until(Duration::from_secs(3), || {
                a.node.session_state(session) == Some(SessionState::Connected)
                    && remote.node.session_state(session) == Some(SessionState::Connected)
            })
            .await
        );
    }
}

#[tokio::test]
async fn unreachable_relay_fails_negotiation_up_front() {
    let lookup = MemoryLookup::new();
    let relay = MemoryRelay::new();
    let a = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_secs(1)))
        .await
        .unwrap();

    relay.set_reachable(false);
    assert!(matches!(
        a.node.negotiate(Keypair::generate().peer_id()).await,
        Err(NodeError::Signaling(SignalingError::Relay(_)))
    ));
}

#[tokio::test]
async fn shutdown_cancels_open_sessions() {
    let lookup = MemoryLookup::new();
    let relay = MemoryRelay::new();
    let a = TestNode::spawn_with_signaling(&lookup, opts(&relay, Duration::from_secs(30)))
        .await
        .unwrap();

    let session = a.node.negotiate(Keypair::generate().peer_id()).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || {
            a.node.session_state(&session) == Some(SessionState::OfferSent)
        })
        .await
    );

    a.node.shutdown().await;
    assert!(
        wait_until(Duration::from_secs(1), || {
            a.node.session_state(&session) == Some(SessionState::Cancelled)
        })
        .await
    );
}
