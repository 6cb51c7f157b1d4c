use crate::config::{RouteConfig, RouteTarget};
use crate::error::TransportError;
use crate::packet::Packet;
use crate::registry::DeviceRegistry;
use mavlink::ardupilotmega::MavMessage;
use mavlink::MavHeader;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Emitted the first time a sysid is observed, for the manifest publisher
/// and the retained discovery topic.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub device_id: String,
    pub sysid: u8,
    pub transport_name: String,
}

/// A frame queued for a transport's TX loop.
#[derive(Debug, Clone)]
pub struct TxItem {
    pub bytes: Vec<u8>,
    /// UDP peer to send to; ignored by serial transports.
    pub dest_addr: Option<SocketAddr>,
}

#[derive(Clone)]
pub struct TransportHandle {
    pub name: String,
    pub is_serial: bool,
    pub tx: mpsc::Sender<TxItem>,
}

/// Everything the router needs to decide where an inbound frame goes.
pub struct RouterInput {
    pub transport_name: String,
    pub src_addr: Option<SocketAddr>,
    pub header: MavHeader,
    pub raw: Vec<u8>,
    pub packet: Packet,
    /// The decoded message, when the frame parsed cleanly. Used to feed the
    /// mission upload/download FSMs before the frame is forwarded/published.
    pub msg: Option<MavMessage>,
}

const GLOBAL_DEDUPE_WINDOW: Duration = Duration::from_millis(200);

pub struct Router {
    registry: Arc<DeviceRegistry>,
    transports: RwLock<HashMap<String, TransportHandle>>,
    last_addr: RwLock<HashMap<String, SocketAddr>>,
    routes: Vec<RouteConfig>,
    forward_socket: UdpSocket,
    recent_seen: RwLock<HashMap<String, Instant>>,
    recent_forwarded: RwLock<HashMap<(String, String, String), Instant>>,
    publish_tx: mpsc::Sender<Packet>,
    discovery_tx: mpsc::Sender<DiscoveryEvent>,
    pub dropped: std::sync::atomic::AtomicU64,
}

impl Router {
    pub async fn new(
        registry: Arc<DeviceRegistry>,
        routes: Vec<RouteConfig>,
        publish_tx: mpsc::Sender<Packet>,
        discovery_tx: mpsc::Sender<DiscoveryEvent>,
    ) -> anyhow::Result<Self> {
        let forward_socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            registry,
            transports: RwLock::new(HashMap::new()),
            last_addr: RwLock::new(HashMap::new()),
            routes,
            forward_socket,
            recent_seen: RwLock::new(HashMap::new()),
            recent_forwarded: RwLock::new(HashMap::new()),
            publish_tx,
            discovery_tx,
            dropped: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub async fn register_transport(&self, handle: TransportHandle) {
        self.transports.write().await.insert(handle.name.clone(), handle);
    }

    pub async fn last_addr_for(&self, transport_name: &str) -> Option<SocketAddr> {
        self.last_addr.read().await.get(transport_name).copied()
    }

    pub async fn route_once(&self, input: RouterInput) {
        let origin = input.transport_name.clone();

        // 1. Record sysid/transport observation and last UDP peer address.
        let (device_id, is_new) = self
            .registry
            .upsert(input.header.system_id, &origin, Some(input.header.component_id))
            .await;
        if is_new {
            let _ = self
                .discovery_tx
                .send(DiscoveryEvent {
                    device_id,
                    sysid: input.header.system_id,
                    transport_name: origin.clone(),
                })
                .await;
        }
        if let Some(addr) = input.src_addr {
            self.last_addr.write().await.insert(origin.clone(), addr);
        }

        // 2. Global content-addressed dedupe.
        let digest = hex::encode(Sha256::digest(&input.raw));
        if self.seen_recently(&digest).await {
            debug!("dropping duplicate frame from {} (digest {})", origin, digest);
            return;
        }

        // 3. Declarative forwards.
        let mut already_sent: std::collections::HashSet<String> = std::collections::HashSet::new();
        for rule in &self.routes {
            if rule.from != "any" && rule.from != origin {
                continue;
            }
            for target in &rule.to {
                let target_key = target_key(target);
                if self
                    .forwarded_recently(&origin, &digest, &target_key, rule.dedupe_window_s)
                    .await
                {
                    continue;
                }
                self.send_to_target(target, &input.raw).await;
                already_sent.insert(target_key);
            }
        }

        // 4. Routing policy for the remaining transports.
        let sysid = input.header.system_id;
        let transports = self.transports.read().await.clone();
        for (name, handle) in transports.iter() {
            if *name == origin || already_sent.contains(name) {
                continue;
            }
            let allowed = if sysid >= 250 {
                true
            } else {
                self.registry.has_observed_gcs(name).await
            };
            if !allowed {
                continue;
            }
            self.enqueue(handle, &input.raw).await;
        }

        // 5. Publish to MQTT adapter.
        if self.publish_tx.send(input.packet).await.is_err() {
            warn!("publish queue closed, dropping packet from {}", origin);
        }
    }

    async fn seen_recently(&self, digest: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.recent_seen.write().await;
        seen.retain(|_, t| now.duration_since(*t) < GLOBAL_DEDUPE_WINDOW);
        let was_seen = seen.contains_key(digest);
        seen.insert(digest.to_string(), now);
        was_seen
    }

    async fn forwarded_recently(
        &self,
        origin: &str,
        digest: &str,
        target_key: &str,
        window_s: f64,
    ) -> bool {
        let window = Duration::from_secs_f64(window_s.max(0.0));
        let now = Instant::now();
        let key = (origin.to_string(), digest.to_string(), target_key.to_string());
        let mut forwarded = self.recent_forwarded.write().await;
        forwarded.retain(|_, t| now.duration_since(*t) < window.max(GLOBAL_DEDUPE_WINDOW));
        let was_forwarded = forwarded
            .get(&key)
            .map(|t| now.duration_since(*t) < window)
            .unwrap_or(false);
        forwarded.insert(key, now);
        was_forwarded
    }

    async fn send_to_target(&self, target: &RouteTarget, raw: &[u8]) {
        match target {
            RouteTarget::Udp { udp } => {
                if let Ok(addr) = udp.parse::<SocketAddr>() {
                    if let Err(e) = self.forward_socket.send_to(raw, addr).await {
                        warn!("failed forwarding to udp {}: {}", udp, e);
                    }
                } else {
                    warn!("invalid forwarding udp target '{}'", udp);
                }
            }
            RouteTarget::Port { to_port } => {
                if let Some(handle) = self.transports.read().await.get(to_port).cloned() {
                    self.enqueue(&handle, raw).await;
                } else {
                    warn!("declarative route to unknown transport '{}'", to_port);
                }
            }
        }
    }

    /// Send raw bytes to every transport on which `device_id` has been
    /// observed. Used by the MQTT adapter and mission manager to deliver a
    /// command once a target transport is known. Returns `false` (and sends
    /// nothing) if no transport has seen this device yet.
    pub async fn send_to_device(&self, device_id: &str, bytes: &[u8]) -> bool {
        let names = self.registry.transports_for(device_id).await;
        if names.is_empty() {
            return false;
        }
        let transports = self.transports.read().await;
        for name in &names {
            if let Some(handle) = transports.get(name) {
                self.enqueue(handle, bytes).await;
            }
        }
        true
    }

    /// Enqueue `bytes` on every registered transport, resolving each one's
    /// destination the same way `route_once` does. Used by the GCS heartbeat
    /// generator to reach every connected endpoint.
    pub async fn broadcast(&self, bytes: &[u8]) {
        let transports = self.transports.read().await.clone();
        for handle in transports.values() {
            self.enqueue(handle, bytes).await;
        }
    }

    async fn enqueue(&self, handle: &TransportHandle, raw: &[u8]) {
        let dest_addr = self.last_addr_for(&handle.name).await;
        let item = TxItem {
            bytes: raw.to_vec(),
            dest_addr,
        };
        if handle.tx.try_send(item).is_err() {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!("transport '{}': {}", handle.name, TransportError::QueueFull);
        }
    }
}

fn target_key(target: &RouteTarget) -> String {
    match target {
        RouteTarget::Udp { udp } => format!("udp:{}", udp),
        RouteTarget::Port { to_port } => format!("port:{}", to_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::collections::HashMap as Map;

    fn test_header(sysid: u8) -> MavHeader {
        MavHeader {
            system_id: sysid,
            component_id: 1,
            sequence: 0,
        }
    }

    fn test_packet(origin: &str, sysid: u8) -> Packet {
        Packet {
            device_id: format!("mav_sys{}", sysid),
            schema: "mavlink",
            msg_type: "HEARTBEAT".to_string(),
            fields: Map::new(),
            raw_bytes: Some(vec![1, 2, 3]),
            timestamp: 0.0,
            origin: origin.to_string(),
            src_sysid: Some(sysid),
            src_compid: Some(1),
            dest_sysid: None,
            dest_compid: None,
        }
    }

    async fn new_router() -> (Router, mpsc::Receiver<Packet>) {
        let (publish_tx, publish_rx) = mpsc::channel(16);
        let (discovery_tx, _discovery_rx) = mpsc::channel(16);
        let registry = Arc::new(DeviceRegistry::new());
        let router = Router::new(registry, vec![], publish_tx, discovery_tx)
            .await
            .unwrap();
        (router, publish_rx)
    }

    #[tokio::test]
    async fn never_forwards_to_origin() {
        let (router, _rx) = new_router().await;
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        router
            .register_transport(TransportHandle {
                name: "a".into(),
                is_serial: false,
                tx: tx_a,
            })
            .await;
        router
            .register_transport(TransportHandle {
                name: "b".into(),
                is_serial: false,
                tx: tx_b,
            })
            .await;

        // sysid 251 (GCS) observed first so broadcast reaches everyone but origin.
        router
            .route_once(RouterInput {
                transport_name: "a".into(),
                src_addr: None,
                header: test_header(251),
                raw: vec![9, 9, 9],
                packet: test_packet("a", 251),
                msg: None,
            })
            .await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn vehicle_frames_only_reach_gcs_observing_transports() {
        let (router, _rx) = new_router().await;
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        router
            .register_transport(TransportHandle {
                name: "veh".into(),
                is_serial: false,
                tx: tx_a,
            })
            .await;
        router
            .register_transport(TransportHandle {
                name: "gcs".into(),
                is_serial: false,
                tx: tx_b,
            })
            .await;

        // gcs transport has observed a GCS sysid (251).
        router
            .route_once(RouterInput {
                transport_name: "gcs".into(),
                src_addr: None,
                header: test_header(251),
                raw: vec![1],
                packet: test_packet("gcs", 251),
                msg: None,
            })
            .await;
        let _ = rx_a.try_recv();

        // vehicle frame from sysid 3 on "veh" should reach "gcs" only.
        router
            .route_once(RouterInput {
                transport_name: "veh".into(),
                src_addr: None,
                header: test_header(3),
                raw: vec![2],
                packet: test_packet("veh", 3),
                msg: None,
            })
            .await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn duplicate_frame_within_window_is_suppressed() {
        let (router, mut publish_rx) = new_router().await;
        let (tx_a, _rx_a) = mpsc::channel(16);
        router
            .register_transport(TransportHandle {
                name: "a".into(),
                is_serial: false,
                tx: tx_a,
            })
            .await;

        for _ in 0..2 {
            router
                .route_once(RouterInput {
                    transport_name: "a".into(),
                    src_addr: None,
                    header: test_header(3),
                    raw: vec![7, 7, 7],
                    packet: test_packet("a", 3),
                    msg: None,
                })
                .await;
        }

        assert!(publish_rx.try_recv().is_ok());
        assert!(publish_rx.try_recv().is_err());
    }
}
