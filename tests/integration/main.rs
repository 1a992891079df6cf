//! Capsule integration test harness.
//!
//! Every node runs in-process: a real TCP listener on loopback, real Noise
//! upgrades, and a shared `MemoryLookup` standing in for the DHT and the
//! rendezvous. Nothing here needs root or network namespaces.
//!
//!   cargo test --test integration
//!
//! Each `TestNode` stops its listener and stream tasks when dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use capsule_core::crypto::{HandshakeRole, Keypair};
use capsule_core::PeerId;
use capsule_services::protocol::open_stream;
use capsule_services::signaling::accept_loop;
use capsule_services::{
    Connector, ContentCapsuleStore, DiscoveryEngine, DiscoveryError, FileSharingHandler,
    GossipBus, MemoryChannelFactory, MemoryLookup, MemoryRelay, NoiseSecureTransport, Node,
    PeerDirectory, PeerRecord, ProtocolRouter, SecureChannelUpgrader, SecuredChannel,
    SessionTable, SignalingSetup,
};

mod content;
mod discovery;
mod signaling;
mod streams;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CONTENT_TOPIC: &str = "capsule/content";
pub const RENDEZVOUS_KEY: &str = "capsule/it";
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Signaling wiring for a node that should negotiate direct channels.
pub struct SignalingOpts {
    pub relay: MemoryRelay,
    pub answer_timeout: Duration,
}

pub struct TestNode {
    pub node: Node,
    pub keypair: Arc<Keypair>,
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl TestNode {
    pub async fn spawn(lookup: &MemoryLookup) -> Result<Self> {
        Self::build(lookup, None).await
    }

    /// A node that also answers offers arriving on `opts.relay`.
    pub async fn spawn_with_signaling(lookup: &MemoryLookup, opts: SignalingOpts) -> Result<Self> {
        Self::build(lookup, Some(opts)).await
    }

    async fn build(lookup: &MemoryLookup, signaling: Option<SignalingOpts>) -> Result<Self> {
        let keypair = Arc::new(Keypair::generate());
        let id = keypair.peer_id();
        let upgrader = upgrader_for(keypair.clone());

        let store = ContentCapsuleStore::new(Arc::new(lookup.handle_for(id)), 3);
        let directory = PeerDirectory::new(id);
        let connector = LinkConnector {
            upgrader: upgrader.clone(),
            directory: directory.clone(),
        };
        let discovery = DiscoveryEngine::new(
            directory,
            Arc::new(connector),
            Some(Arc::new(lookup.clone())),
            CONNECT_TIMEOUT,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        discovery.set_listen_addrs(vec![addr]);

        let mut router = ProtocolRouter::new();
        router.register(Arc::new(FileSharingHandler::new(store.clone())));
        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(serve_streams(
            listener,
            upgrader,
            Arc::new(router),
            shutdown.clone(),
        ));

        let bus = GossipBus::local(64, 16);
        let node = match signaling {
            None => Node::new(store, bus, discovery, CONTENT_TOPIC),
            Some(opts) => {
                let sessions = SessionTable::default();
                let relay = Arc::new(opts.relay);
                let channels = Arc::new(MemoryChannelFactory::new(id));
                tokio::spawn(accept_loop(
                    id,
                    relay.clone(),
                    channels.clone(),
                    sessions.clone(),
                    opts.answer_timeout,
                    shutdown.subscribe(),
                ));
                Node::with_signaling(
                    store,
                    bus,
                    discovery,
                    CONTENT_TOPIC,
                    SignalingSetup {
                        relay,
                        channels,
                        answer_timeout: opts.answer_timeout,
                        sessions,
                    },
                )
            }
        };

        Ok(Self {
            node,
            keypair,
            addr,
            shutdown,
        })
    }

    pub fn id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    /// How another node would learn about this one.
    pub fn record(&self) -> PeerRecord {
        PeerRecord::discovered(self.id(), vec![self.addr])
    }

    /// Dial `remote`, upgrade, and name `protocol` on the new channel.
    pub async fn open(&self, remote: &TestNode, protocol: &str) -> Result<SecuredChannel> {
        let stream = TcpStream::connect(remote.addr).await?;
        let mut channel = upgrader_for(self.keypair.clone())
            .upgrade_expecting(stream, remote.id())
            .await?;
        open_stream(&mut channel, protocol).await?;
        Ok(channel)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

pub fn upgrader_for(keypair: Arc<Keypair>) -> SecureChannelUpgrader {
    SecureChannelUpgrader::new(Arc::new(NoiseSecureTransport::new(
        keypair,
        HANDSHAKE_TIMEOUT,
    )))
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Accept and serve secured streams. Open streams are dropped on shutdown.
async fn serve_streams(
    listener: TcpListener,
    upgrader: SecureChannelUpgrader,
    router: Arc<ProtocolRouter>,
    shutdown: broadcast::Sender<()>,
) {
    let mut stop = shutdown.subscribe();
    loop {
        let stream = tokio::select! {
            _ = stop.recv() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => continue,
            },
        };
        let upgrader = upgrader.clone();
        let router = router.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let Ok(channel) = upgrader.upgrade(stream, HandshakeRole::Responder).await else {
                return;
            };
            tokio::select! {
                _ = stop.recv() => {}
                _ = router.serve(channel) => {}
            }
        });
    }
}

/// Dials over TCP and holds the secured channel until the remote closes it.
struct LinkConnector {
    upgrader: SecureChannelUpgrader,
    directory: PeerDirectory,
}

#[async_trait]
impl Connector for LinkConnector {
    async fn connect(&self, peer: &PeerRecord, addr: SocketAddr) -> Result<(), DiscoveryError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DiscoveryError::Unreachable {
                addr,
                reason: e.to_string(),
            })?;
        let mut channel = self.upgrader.upgrade_expecting(stream, peer.id).await?;
        let directory = self.directory.clone();
        let id = peer.id;
        let link = tokio::spawn(async move {
            while let Ok(Some(_)) = channel.recv().await {}
            directory.mark_disconnected(&id);
        });
        self.directory.attach_task(&peer.id, link.abort_handle());
        Ok(())
    }
}
