use crate::*;

use capsule_core::wire::FILESHARING_PROTOCOL;
use capsule_core::Digest;
use capsule_services::protocol::request_capsule;
use capsule_services::SecurityError;

#[tokio::test]
async fn fetch_over_a_secured_stream() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    let shared = a.node.share("served by a", "tok").await.unwrap();

    let mut channel = b.open(&a, FILESHARING_PROTOCOL).await.unwrap();
    assert_eq!(channel.remote(), a.id());
    let got = request_capsule(&mut channel, &shared.digest).await.unwrap();
    assert_eq!(got.unwrap(), "served by a");

    // Same channel, several requests
    let missing = request_capsule(&mut channel, &Digest::of(b"nobody has this"))
        .await
        .unwrap();
    assert!(missing.is_none());
    channel.close().await.unwrap();
}

#[tokio::test]
async fn large_payloads_span_many_frames() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let shared = a.node.share(payload.clone(), "big").await.unwrap();

    let mut channel = b.open(&a, FILESHARING_PROTOCOL).await.unwrap();
    let got = request_capsule(&mut channel, &shared.digest)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.len(), payload.len());
    assert_eq!(&got[..], &payload[..]);
}

#[tokio::test]
async fn unknown_protocol_stream_is_dropped() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    let mut channel = b.open(&a, "/capsule/unknown/0.0.1").await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), channel.recv())
        .await
        .unwrap();
    assert!(!matches!(reply, Ok(Some(_))), "server must not answer");
}

#[tokio::test]
async fn dialling_the_wrong_identity_is_refused() {
    let lookup = MemoryLookup::new();
    let a = TestNode::spawn(&lookup).await.unwrap();
    let b = TestNode::spawn(&lookup).await.unwrap();

    // b's identity at a's address
    let stream = TcpStream::connect(a.addr).await.unwrap();
    let err = upgrader_for(Arc::new(Keypair::generate()))
        .upgrade_expecting(stream, b.id())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SecurityError::UnexpectedPeer { expected, actual } if expected == b.id() && actual == a.id()
    ));
}

#[tokio::test]
async fn plaintext_peer_never_gets_a_channel() {
    use tokio::io::AsyncWriteExt;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = stream.write_all(b"\x00\x05hello plain world").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let result = upgrader_for(Arc::new(Keypair::generate()))
        .upgrade(stream, HandshakeRole::Initiator)
        .await;
    assert!(result.is_err());
}
