//! dht-node: standalone host process for the Meridian DHT core.
//!
//! Owns the one thing `dht-core` deliberately doesn't: a live UDP socket and
//! the system clock. Drives the maintenance loop on a fixed tick, forwards
//! inbound datagrams into `Dht::handle_packet`, and exposes friend tracking
//! and bootstrap control to other local processes over a JSON-RPC Unix
//! socket.

mod config;
mod events;
mod rpc;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dht_core::net::{Clock, SystemClock, UdpTransport};
use dht_core::wire::IpPort;
use dht_core::{Dht, DhtConfig};
use dht_crypto::x25519::X25519StaticSecret;
use dht_events::EventBus;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::DhtNodeConfig;
use crate::rpc::RpcServer;

/// Tick interval for the maintenance loop: a few times a second, per the
/// responsiveness the close-list refresh and NAT-ping rate limits assume.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

const MAX_DATAGRAM_SIZE: usize = 1500;

/// Shared process state: the DHT handle, the event bus, and the loaded
/// configuration.
pub struct NodeState {
    pub dht: Mutex<Dht>,
    pub events: EventBus,
    pub config: DhtNodeConfig,
}

/// [`UdpTransport`] backed by a real `tokio::net::UdpSocket`.
struct TokioUdp {
    socket: UdpSocket,
}

impl UdpTransport for TokioUdp {
    async fn udp_send(&self, to: SocketAddr, data: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(data, to).await.map(|_| ())
    }

    async fn udp_recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DhtNodeConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.filter))
        .init();

    info!("dht-node starting");

    let event_bus = EventBus::new(1000);

    let secret = load_or_generate_identity(&config)?;
    let mut dht = Dht::new(
        DhtConfig {
            holepunching_enabled: config.network.holepunching_enabled,
        },
        secret,
    );
    info!(self_key = hex::encode(dht.self_key()), "identity loaded");

    {
        let events = event_bus.clone();
        dht.set_node_learned_callback(Box::new(move |node| {
            events::node_added(&events, unix_now(), &node.key);
        }));
    }

    let save_path = config.save_path();
    if save_path.exists() {
        match std::fs::read(&save_path) {
            Ok(data) => {
                if let Err(e) = dht.load(&data) {
                    warn!(error = %e, "could not restore saved DHT state, starting fresh");
                }
            }
            Err(e) => warn!(error = %e, "could not read save file"),
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.network.bind_address, config.network.listen_port).parse()?;
    let socket = UdpSocket::bind(bind_addr).await?;
    info!(local_addr = %socket.local_addr()?, "UDP socket bound");
    let transport = Arc::new(TokioUdp { socket });

    let state = Arc::new(NodeState {
        dht: Mutex::new(dht),
        events: event_bus,
        config,
    });

    for seed in &state.config.bootstrap.seed_nodes {
        if let Ok(key_bytes) = hex::decode(&seed.public_key) {
            if let Ok(key) = <[u8; 32]>::try_from(key_bytes.as_slice()) {
                let mut dht = state.dht.lock().await;
                if let Err(e) = dht.bootstrap_from_address(&seed.host, state.config.network.ipv6_enabled, seed.port, key) {
                    warn!(host = %seed.host, error = %e, "bootstrap seed resolution failed");
                }
            }
        }
    }
    events::bootstrap_complete(&state.events, unix_now(), state.dht.lock().await.size());

    let socket_path = state.config.save_path().with_file_name("dht.sock");
    let rpc_server = RpcServer::new(state.clone(), socket_path);
    let clock = Arc::new(SystemClock::new());

    let recv_task = tokio::spawn(recv_loop(state.clone(), transport.clone(), clock.clone()));
    let tick_task = tokio::spawn(tick_loop(state.clone(), transport.clone(), clock.clone()));
    let save_task = tokio::spawn(periodic_save(state.clone()));

    tokio::select! {
        result = rpc_server.run() => {
            if let Err(e) = result {
                error!("RPC server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    recv_task.abort();
    tick_task.abort();
    save_task.abort();

    let data = state.dht.lock().await.save();
    if let Err(e) = std::fs::write(state.config.save_path(), data) {
        warn!(error = %e, "failed to persist DHT state on shutdown");
    }

    info!("dht-node stopped");
    Ok(())
}

async fn recv_loop(state: Arc<NodeState>, transport: Arc<TokioUdp>, clock: Arc<SystemClock>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match transport.udp_recv(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "UDP receive error");
                continue;
            }
        };

        let now = clock.now_secs();
        let from_ip = IpPort::udp(from);
        let mut dht = state.dht.lock().await;
        match dht.handle_packet(from_ip, &buf[..len], now) {
            Ok(packets) => {
                drop(dht);
                for packet in packets {
                    if let Err(e) = transport.udp_send(packet.to.addr, &packet.bytes).await {
                        warn!(error = %e, "UDP send error");
                    }
                }
            }
            Err(e) => {
                events::unhandled_crypto_request(&state.events, now, 0, from);
                tracing::debug!(error = %e, %from, "dropped malformed packet");
            }
        }
    }
}

async fn tick_loop(state: Arc<NodeState>, transport: Arc<TokioUdp>, clock: Arc<SystemClock>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        let now = clock.now_secs();
        let packets = {
            let mut dht = state.dht.lock().await;
            dht.tick(now)
        };
        for packet in packets {
            if let Err(e) = transport.udp_send(packet.to.addr, &packet.bytes).await {
                warn!(error = %e, "UDP send error during tick");
            }
        }
    }
}

async fn periodic_save(state: Arc<NodeState>) {
    let interval_secs = state.config.persistence.save_interval_secs.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        let data = state.dht.lock().await.save();
        if let Err(e) = std::fs::write(state.config.save_path(), data) {
            warn!(error = %e, "periodic save failed");
        }
    }
}

/// Wall-clock seconds for event timestamps. Independent of the DHT's own
/// process-relative `SystemClock`, which only needs to be monotonic.
fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn load_or_generate_identity(config: &DhtNodeConfig) -> anyhow::Result<X25519StaticSecret> {
    let path = config.save_path();
    if path.exists() {
        let data = std::fs::read(&path)?;
        if let Ok(loaded) = dht_core::persist::load(&data) {
            if let Some(keypair) = loaded.self_keypair {
                return Ok(X25519StaticSecret::from_bytes(keypair.secret_key));
            }
        }
    }
    Ok(X25519StaticSecret::random())
}
