//! capsuled: Capsule overlay node daemon.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use capsule_core::config::CapsuleConfig;
use capsule_core::crypto::Keypair;

use capsule_services::peer::expiry_loop;
use capsule_services::store::retention_loop;
use capsule_services::{
    ContentCapsuleStore, DiscoveryEngine, DiskLookup, FileSharingHandler, GossipBus,
    NoiseSecureTransport, Node, PeerDirectory, ProtocolRouter, Rendezvous, SecureChannelUpgrader,
};

mod segment;
mod transport;

/// Lower bound for configured loop periods.
const MIN_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CapsuleConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CapsuleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CapsuleConfig::default()
    });

    let interface = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.network.interface.clone());

    // Identity
    let keypair = Arc::new(
        Keypair::load_or_generate(&config.identity.keypair_path)
            .context("failed to load node keypair")?,
    );
    let local_id = keypair.peer_id();
    tracing::info!(peer_id = %local_id.to_hex(), "capsuled starting");

    // Lookup store
    let lookup = Arc::new(
        DiskLookup::new(&config.storage.lookup_root).context("failed to open lookup store")?,
    );
    tracing::info!(root = %config.storage.lookup_root.display(), "lookup store initialized");

    let store = ContentCapsuleStore::new(lookup.clone(), config.storage.chunk_size);
    let bus = GossipBus::local(config.gossip.queue_capacity, config.gossip.subscriber_buffer);
    let directory = PeerDirectory::new(local_id);

    // Secured streams
    let upgrader = SecureChannelUpgrader::new(Arc::new(NoiseSecureTransport::new(
        keypair.clone(),
        config.network.connect_timeout(),
    )));
    let router = {
        let mut r = ProtocolRouter::new();
        r.register(Arc::new(FileSharingHandler::new(store.clone())));
        Arc::new(r)
    };
    let listener = transport::bind(config.network.listen_port)
        .context("failed to bind stream listener")?;
    let listen_port = listener.local_addr()?.port();
    tracing::info!(port = listen_port, "stream listener bound");

    // Local segment
    let interface_index = if config.discovery.local_segment && !interface.is_empty() {
        Some(segment::if_index(&interface)?)
    } else {
        tracing::info!("local-segment discovery disabled");
        None
    };

    let mut advertised = vec![
        SocketAddr::from((Ipv6Addr::LOCALHOST, listen_port)),
        SocketAddr::from(([127, 0, 0, 1], listen_port)),
    ];
    if let Some(index) = interface_index {
        let link_local = segment::link_local_addr(index, config.network.announce_port)?;
        tracing::info!(addr = %link_local, interface, "local link-local address");
        advertised.insert(
            0,
            SocketAddr::V6(SocketAddrV6::new(link_local, listen_port, 0, index)),
        );
    }

    // Discovery
    let connector = Arc::new(transport::TcpConnector::new(
        upgrader.clone(),
        directory.clone(),
    ));
    let rendezvous: Arc<dyn Rendezvous> = lookup.clone();
    let discovery = DiscoveryEngine::new(
        directory.clone(),
        connector,
        Some(rendezvous),
        config.network.connect_timeout(),
    );
    discovery.set_listen_addrs(advertised);

    let node = Node::new(
        store.clone(),
        bus,
        discovery.clone(),
        config.gossip.content_topic.clone(),
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let accept_task = tokio::spawn(transport::accept_loop(
        listener,
        upgrader,
        router,
        directory.clone(),
        shutdown_tx.subscribe(),
    ));

    let advertise_task = {
        let engine = discovery.clone();
        let key = config.discovery.rendezvous_key.clone();
        let interval = config.discovery.advertise_interval().max(MIN_PERIOD);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { engine.advertise(&key, interval, shutdown).await })
    };

    let discovery_task = {
        let engine = discovery.clone();
        let key = config.discovery.rendezvous_key.clone();
        let interval = config.discovery.lookup_interval().max(MIN_PERIOD);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { engine.run(&key, interval, shutdown).await })
    };

    let expiry_task = tokio::spawn(expiry_loop(
        directory.clone(),
        config.discovery.peer_ttl(),
        shutdown_tx.subscribe(),
    ));

    let retention_task = {
        let store = store.clone();
        let retention = config.storage.retention();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let Some(retention) = retention else {
                tracing::info!("capsule index retention disabled");
                let mut shutdown = shutdown;
                let _ = shutdown.recv().await;
                return;
            };
            retention_loop(store, retention, shutdown).await
        })
    };

    let segment_tasks = interface_index.map(|index| {
        let broadcast_task = tokio::spawn(segment::broadcast::broadcast_loop(
            local_id,
            listen_port,
            index,
            config.network.announce_port,
            shutdown_tx.subscribe(),
        ));
        let listener_task = tokio::spawn(segment::listener::listener_loop(
            discovery.clone(),
            index,
            config.network.announce_port,
            shutdown_tx.subscribe(),
        ));
        (broadcast_task, listener_task)
    });

    // HTTP API
    {
        let state = capsule_api::ApiState {
            node: node.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let api_port = config.network.api_port;
        tokio::spawn(async move {
            if let Err(e) = capsule_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    if let Some((broadcast_task, listener_task)) = segment_tasks {
        tokio::spawn(async move {
            match broadcast_task.await {
                Ok(Err(e)) => tracing::error!(error = %e, "local announcement broadcast failed"),
                Err(e) => tracing::error!(error = %e, "local announcement broadcast panicked"),
                Ok(Ok(())) => {}
            }
        });
        tokio::spawn(async move {
            match listener_task.await {
                Ok(Err(e)) => tracing::error!(error = %e, "local announcement listener failed"),
                Err(e) => tracing::error!(error = %e, "local announcement listener panicked"),
                Ok(Ok(())) => {}
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = accept_task          => tracing::error!("stream listener exited: {:?}", r),
        r = advertise_task       => tracing::error!("advertise task exited: {:?}", r),
        r = discovery_task       => tracing::error!("discovery task exited: {:?}", r),
        r = expiry_task          => tracing::error!("expiry task exited: {:?}", r),
        r = retention_task       => tracing::error!("retention task exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    node.shutdown().await;
    tracing::info!("capsuled stopped");
    Ok(())
}
