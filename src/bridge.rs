//! The bridge itself: an explicit, owned value wiring transports, router,
//! mission manager, heartbeat generator, and MQTT adapter together. No
//! global state -- everything reachable from `Bridge::new` hangs off this
//! struct or an `Arc` it holds.

use crate::config::{Config, TransportConfig, TransportKind};
use crate::heartbeat;
use crate::mission::{mission_item_from_int_data, MissionManager};
use crate::mqtt::MqttAdapter;
use crate::registry::DeviceRegistry;
use crate::router::{Router, RouterInput, TransportHandle, TxItem};
use crate::transport::{serial, udp, TransportContext, TransportStats};
use mavlink::ardupilotmega::MavMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const INBOUND_QUEUE_CAPACITY: usize = 4096;
const PUBLISH_QUEUE_CAPACITY: usize = 4096;
const SHUTDOWN_JOIN_DEADLINE: Duration = Duration::from_secs(2);

pub struct Bridge {
    run_flag: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let run_flag = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(DeviceRegistry::new());

        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        let (discovery_tx, discovery_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = mpsc::channel(256);

        let router = Arc::new(Router::new(registry.clone(), config.routes.clone(), publish_tx, discovery_tx).await?);

        let mut tasks = Vec::new();

        for transport in &config.transports {
            let (out_tx, out_rx) = mpsc::channel::<TxItem>(transport.queue_capacity);
            router
                .register_transport(TransportHandle {
                    name: transport.name.clone(),
                    is_serial: transport.kind == TransportKind::Serial,
                    tx: out_tx,
                })
                .await;

            let ctx = TransportContext {
                name: transport.name.clone(),
                inbound_tx: inbound_tx.clone(),
                run_flag: run_flag.clone(),
            };
            let stats = Arc::new(TransportStats::default());
            tasks.push(spawn_transport(transport.clone(), ctx, out_rx, stats));
        }
        drop(inbound_tx);

        let mission = Arc::new(MissionManager::new(
            router.clone(),
            registry.clone(),
            config.gcs.sysid,
            config.gcs.compid,
            status_tx,
        ));
        tasks.push(tokio::spawn(mission.clone().run_timeout_sweeper()));

        let router_for_route_loop = router.clone();
        let mission_for_route_loop = mission.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(input) = inbound_rx.recv().await {
                dispatch_mission_message(&mission_for_route_loop, &input).await;
                router_for_route_loop.route_once(input).await;
            }
        }));

        let (mqtt, eventloop) = MqttAdapter::connect(
            &config.mqtt,
            config.gcs.sysid,
            config.gcs.compid,
            router.clone(),
            registry.clone(),
            mission.clone(),
            config.transports.clone(),
            config.routes.clone(),
        );
        tasks.push(tokio::spawn(
            mqtt.run(eventloop, publish_rx, discovery_rx, status_rx),
        ));

        let heartbeat_router = router.clone();
        let gcs_sysid = config.gcs.sysid;
        let gcs_compid = config.gcs.compid;
        let heartbeat_interval = config.gcs.heartbeat_interval_secs;
        tasks.push(tokio::spawn(async move {
            heartbeat::run(heartbeat_router, gcs_sysid, gcs_compid, heartbeat_interval).await;
        }));

        info!(
            transports = config.transports.len(),
            routes = config.routes.len(),
            "bridge initialized"
        );

        Ok(Self { run_flag, tasks })
    }

    /// Runs until interrupted (SIGINT), then flips the shared run flag and
    /// gives every supervised task a bounded window to wind down.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested, stopping supervised tasks");
        self.run_flag.store(false, Ordering::Relaxed);

        let deadline = tokio::time::sleep(SHUTDOWN_JOIN_DEADLINE);
        tokio::pin!(deadline);
        for task in self.tasks.drain(..) {
            tokio::select! {
                _ = task => {}
                _ = &mut deadline => {
                    warn!("shutdown deadline reached with tasks still running, aborting");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Feed mission-protocol messages from a vehicle into the upload/download
/// FSMs before the frame goes through general routing/publishing.
async fn dispatch_mission_message(mission: &Arc<MissionManager>, input: &RouterInput) {
    let sysid = input.header.system_id;
    match &input.msg {
        Some(MavMessage::MISSION_REQUEST(data)) => {
            mission.on_mission_request(sysid, data.seq).await;
        }
        Some(MavMessage::MISSION_REQUEST_INT(data)) => {
            mission.on_mission_request(sysid, data.seq).await;
        }
        Some(MavMessage::MISSION_ACK(data)) => {
            mission.on_mission_ack(sysid, data).await;
        }
        Some(MavMessage::MISSION_COUNT(data)) => {
            mission.on_mission_count(sysid, data.count).await;
        }
        Some(MavMessage::MISSION_ITEM_INT(data)) => {
            mission.on_mission_item(sysid, mission_item_from_int_data(data)).await;
        }
        _ => {}
    }
}

fn spawn_transport(
    config: TransportConfig,
    ctx: TransportContext,
    out_rx: mpsc::Receiver<TxItem>,
    stats: Arc<TransportStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match config.kind {
            TransportKind::UdpListen | TransportKind::UdpConnect => {
                udp::run(config, ctx, out_rx, stats).await;
            }
            TransportKind::Serial => {
                serial::run(config, ctx, out_rx, stats).await;
            }
        }
    })
}
