pub mod command;

use crate::config::{MqttConfig, RouteConfig, TransportConfig};
use crate::error::CommandError;
use crate::manifest;
use crate::mission::{MissionManager, MissionStatus};
use crate::mqtt::command::Command;
use crate::packet::Packet;
use crate::registry::DeviceRegistry;
use crate::router::{DiscoveryEvent, Router};
use command::WaypointSpec;
use mavlink::ardupilotmega::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, COMMAND_LONG_DATA, HEARTBEAT_DATA,
    REQUEST_DATA_STREAM_DATA, SET_MODE_DATA,
};
use mavlink::{MavHeader, MavlinkVersion};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, Publish, QoS};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

struct PendingCommand {
    cmd: Command,
    queued_at: Instant,
}

pub struct MqttAdapter {
    client: AsyncClient,
    root: String,
    gcs_sysid: u8,
    gcs_compid: u8,
    router: Arc<Router>,
    registry: Arc<DeviceRegistry>,
    mission: Arc<MissionManager>,
    transports: Vec<TransportConfig>,
    routes: Vec<RouteConfig>,
    pending: RwLock<HashMap<u8, Vec<PendingCommand>>>,
    publish_drops: AtomicU64,
    started_at: Instant,
}

impl MqttAdapter {
    pub fn connect(
        config: &MqttConfig,
        gcs_sysid: u8,
        gcs_compid: u8,
        router: Arc<Router>,
        registry: Arc<DeviceRegistry>,
        mission: Arc<MissionManager>,
        transports: Vec<TransportConfig>,
        routes: Vec<RouteConfig>,
    ) -> (Arc<Self>, rumqttc::EventLoop) {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(u), Some(p)) = (&config.username, &config.password) {
            options.set_credentials(u.clone(), p.clone());
        }
        let will_topic = format!("{}/bridge/status", config.root);
        options.set_last_will(LastWill::new(
            will_topic,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, 64);
        let adapter = Arc::new(Self {
            client,
            root: config.root.clone(),
            gcs_sysid,
            gcs_compid,
            router,
            registry,
            mission,
            transports,
            routes,
            pending: RwLock::new(HashMap::new()),
            publish_drops: AtomicU64::new(0),
            started_at: Instant::now(),
        });
        (adapter, eventloop)
    }

    pub async fn run(
        self: Arc<Self>,
        eventloop: rumqttc::EventLoop,
        mut publish_rx: mpsc::Receiver<Packet>,
        mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
        mut mission_status_rx: mpsc::Receiver<MissionStatus>,
    ) {
        let receiver = self.clone().receiver_loop(eventloop);
        let sender = self.clone().telemetry_loop(&mut publish_rx);
        let discovery = self.clone().discovery_loop(&mut discovery_rx);
        let mission_status = self.clone().mission_status_loop(&mut mission_status_rx);
        let pending = self.clone().pending_loop();
        let status = self.clone().status_loop();

        tokio::join!(receiver, sender, discovery, mission_status, pending, status);
    }

    async fn receiver_loop(self: Arc<Self>, mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected, subscribing and republishing manifest");
                    self.on_connect().await;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.handle_inbound(publish).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn on_connect(&self) {
        let topics = [
            format!("{}/cmd/+", self.root),
            format!("{}/devices/+/cmd/+", self.root),
            format!("{}/mission/upload", self.root),
            "command/+/+/+".to_string(),
        ];
        for topic in topics {
            if let Err(e) = self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                warn!("failed to subscribe to {}: {}", topic, e);
            }
        }
        self.publish_manifest().await;
        self.publish_discovery_snapshot().await;
    }

    async fn publish_manifest(&self) {
        let manifest = manifest::build(
            &self.root,
            self.gcs_sysid,
            self.gcs_compid,
            &self.transports,
            &self.routes,
            &self.registry,
        )
        .await;
        self.publish_retained(&format!("{}/bridge/manifest", self.root), &manifest).await;
    }

    async fn publish_discovery_snapshot(&self) {
        let snapshot = self.registry.snapshot().await;
        if let JsonValue::Object(devices) = snapshot {
            for (device_id, info) in devices {
                let transports = info.get("transports").cloned().unwrap_or(json!([]));
                let payload = json!({
                    "schema": "mavlink",
                    "sysid": info.get("sysid"),
                    "status": "discovered",
                    "transports": transports,
                });
                self.publish_retained(
                    &format!("{}/devices/{}/telem/state/discovery", self.root, device_id),
                    &payload,
                )
                .await;
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>, rx: &mut mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = rx.recv().await {
            let payload = json!({
                "schema": "mavlink",
                "sysid": event.sysid,
                "status": "discovered",
                "transports": [event.transport_name],
            });
            self.publish_retained(
                &format!("{}/devices/{}/telem/state/discovery", self.root, event.device_id),
                &payload,
            )
            .await;
            self.publish_manifest().await;
            self.flush_pending_for(event.sysid).await;
        }
    }

    async fn mission_status_loop(self: Arc<Self>, rx: &mut mpsc::Receiver<MissionStatus>) {
        while let Some(status) = rx.recv().await {
            let topic = if status.topic_suffix == "downloaded" {
                format!("Nomad/missions/downloaded/{}", status.sysid)
            } else if let Some((prefix, tail)) = status.topic_suffix.split_once('/') {
                format!("Nomad/missions/{}/{}/{}", prefix, status.sysid, tail)
            } else {
                format!("Nomad/missions/{}/{}", status.topic_suffix, status.sysid)
            };
            self.publish(&topic, &status.payload).await;
        }
    }

    async fn telemetry_loop(self: Arc<Self>, rx: &mut mpsc::Receiver<Packet>) {
        while let Some(packet) = rx.recv().await {
            self.publish_telemetry(&packet).await;
        }
    }

    async fn publish_telemetry(&self, packet: &Packet) {
        let raw_topic = format!(
            "{}/devices/{}/telem/raw/mavlink/{}",
            self.root, packet.device_id, packet.msg_type
        );
        let raw_payload = json!({
            "fields": packet.fields,
            "src_addr": packet.origin,
            "port": packet.origin,
        });
        self.publish(&raw_topic, &raw_payload).await;

        if packet.msg_type == "HEARTBEAT" {
            let liveness = json!({"status": "online", "ts": packet.timestamp});
            let topic = format!("{}/devices/{}/telem/state/heartbeat", self.root, packet.device_id);
            self.publish_retained(&topic, &liveness).await;
        }

        if packet.msg_type == "ATTITUDE" {
            let attitude = json!({
                "roll": packet.fields.get("roll"),
                "pitch": packet.fields.get("pitch"),
                "yaw": packet.fields.get("yaw"),
                "rollspeed": packet.fields.get("rollspeed"),
                "pitchspeed": packet.fields.get("pitchspeed"),
                "yawspeed": packet.fields.get("yawspeed"),
                "t": packet.timestamp,
            });
            let topic = format!("{}/devices/{}/telem/pose/attitude", self.root, packet.device_id);
            self.publish(&topic, &attitude).await;
        }

        let analytics_topic = format!(
            "sources/source_sysid_{}/source_compid_{}/dest_sysid_{}/dest_compid_{}/{}/{}",
            packet.src_sysid.unwrap_or(0),
            packet.src_compid.unwrap_or(0),
            packet.dest_sysid.unwrap_or(0),
            packet.dest_compid.unwrap_or(0),
            packet.msg_type,
            packet.origin,
        );
        self.publish(&analytics_topic, &json!(packet.fields)).await;
    }

    async fn handle_inbound(&self, publish: Publish) {
        let topic = publish.topic.clone();
        let parsed = command::decode(&topic, &publish.payload);
        match parsed {
            Ok(cmd) => self.dispatch(&topic, cmd).await,
            Err(e) => {
                warn!("rejected command on {}: {}", topic, e);
                let shape = command::peek_msg_type(&publish.payload).unwrap_or_else(|| "UNKNOWN".into());
                self.ack(&topic, "rejected", &shape, None, Some(e.to_string())).await;
            }
        }
    }

    async fn dispatch(&self, topic: &str, cmd: Command) {
        let shape = command_shape_name(&cmd);
        match &cmd {
            Command::LoadWaypoints { filename, waypoints } => {
                self.handle_load_waypoints(filename, waypoints.clone()).await;
                return;
            }
            Command::MissionUpload { sysid, items } => {
                let mission_items = items
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(i, w)| w.into_item(i as u16))
                    .collect::<Vec<_>>();
                self.mission.start_upload(*sysid, 1, mission_items, None).await;
                self.ack(topic, "encoded", shape, None, None).await;
                return;
            }
            Command::DownloadMission { sysid, target_comp } => {
                self.mission.start_download(*sysid, *target_comp).await;
                self.ack(topic, "encoded", shape, None, None).await;
                return;
            }
            _ => {}
        }

        let target_sys = target_sysid(&cmd);
        let Some(sysid) = target_sys else {
            warn!("command on {} has no resolvable target", topic);
            self.ack(topic, "rejected", shape, None, Some("no target sysid".into())).await;
            return;
        };

        let device_id = DeviceRegistry::device_id_for_sysid(sysid);
        let bytes = match encode(&cmd, self.gcs_sysid, self.gcs_compid) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode command on {}: {}", topic, e);
                self.ack(topic, "rejected", shape, None, Some(e.to_string())).await;
                return;
            }
        };

        let byte_len = bytes.len();
        if self.router.send_to_device(&device_id, &bytes).await {
            self.ack(topic, "encoded", shape, Some(byte_len), None).await;
        } else {
            warn!("no transport known yet for sysid {}, queueing command", sysid);
            self.pending.write().await.entry(sysid).or_default().push(PendingCommand {
                cmd,
                queued_at: Instant::now(),
            });
        }
    }

    async fn handle_load_waypoints(&self, filename: &str, waypoints: Vec<WaypointSpec>) {
        let validation_topic = format!("{}/waypoints/{}/validation", "Nomad", filename);
        let mut ok = true;
        let mut details = Vec::new();
        for (i, wp) in waypoints.iter().enumerate() {
            let lat = wp.lat.or(wp.x);
            let lon = wp.lon.or(wp.y);
            if lat.map(|v| !(-90.0..=90.0).contains(&v)).unwrap_or(true)
                || lon.map(|v| !(-180.0..=180.0).contains(&v)).unwrap_or(true)
            {
                ok = false;
                details.push(format!("waypoint {} has invalid lat/lon", i));
            }
        }
        let items: Vec<_> = waypoints
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, w)| w.into_item(i as u16))
            .collect();
        let hash = crate::mission::canonical_hash(&items);
        let payload = json!({"ok": ok, "details": details, "hash": hash, "count": items.len()});
        self.publish(&validation_topic, &payload).await;
        if !ok {
            warn!("load_waypoints '{}' failed validation: {:?}", filename, details);
        }
    }

    async fn flush_pending_for(&self, sysid: u8) {
        let queued = self.pending.write().await.remove(&sysid);
        let Some(queued) = queued else { return };
        let device_id = DeviceRegistry::device_id_for_sysid(sysid);
        for pending in queued {
            if let Ok(bytes) = encode(&pending.cmd, self.gcs_sysid, self.gcs_compid) {
                if self.router.send_to_device(&device_id, &bytes).await {
                    let topic = format!("command/{}/{}/ack", sysid, self.gcs_compid);
                    self.publish(
                        &topic,
                        &json!({"status": "delivered", "queued_for_s": pending.queued_at.elapsed().as_secs_f64()}),
                    )
                    .await;
                }
            }
        }
    }

    async fn pending_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        loop {
            tick.tick().await;
            let sysids: Vec<u8> = self.pending.read().await.keys().copied().collect();
            for sysid in sysids {
                if !self.registry.transports_for(&DeviceRegistry::device_id_for_sysid(sysid)).await.is_empty() {
                    self.flush_pending_for(sysid).await;
                }
            }
        }
    }

    async fn status_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        loop {
            tick.tick().await;
            let pending_count: usize = self.pending.read().await.values().map(|v| v.len()).sum();
            let payload = json!({
                "uptime_s": self.started_at.elapsed().as_secs_f64(),
                "publish_drops": self.publish_drops.load(Ordering::Relaxed),
                "router_drops": self.router.dropped.load(Ordering::Relaxed),
                "pending_commands": pending_count,
            });
            self.publish(&format!("{}/bridge/status", self.root), &payload).await;
        }
    }

    async fn ack(&self, cmd_topic: &str, status: &str, msg_type: &str, bytes: Option<usize>, detail: Option<String>) {
        let topic = format!("{}/ack", cmd_topic);
        let payload = json!({"status": status, "msg_type": msg_type, "bytes": bytes, "detail": detail});
        self.publish(&topic, &payload).await;
    }

    async fn publish(&self, topic: &str, payload: &JsonValue) {
        self.publish_with(topic, payload, false).await;
    }

    async fn publish_retained(&self, topic: &str, payload: &JsonValue) {
        self.publish_with(topic, payload, true).await;
    }

    async fn publish_with(&self, topic: &str, payload: &JsonValue, retain: bool) {
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                error!("failed to serialize payload for {}: {}", topic, e);
                return;
            }
        };
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, retain, bytes)
            .await
        {
            self.publish_drops.fetch_add(1, Ordering::Relaxed);
            warn!("mqtt publish to {} failed: {}", topic, e);
        }
    }
}

/// The shape name a command was decoded from, echoed back on its ack so a
/// subscriber can correlate the ack with the command it sent.
fn command_shape_name(cmd: &Command) -> &'static str {
    match cmd {
        Command::CommandLong { .. } => "COMMAND_LONG",
        Command::SetMode { .. } => "SET_MODE",
        Command::MissionUpload { .. } => "MISSION_UPLOAD",
        Command::Heartbeat { .. } => "HEARTBEAT",
        Command::RequestDataStream { .. } => "REQUEST_DATA_STREAM",
        Command::LoadWaypoints { .. } => "LOAD_WAYPOINTS",
        Command::DownloadMission { .. } => "DOWNLOAD_MISSION",
    }
}

fn target_sysid(cmd: &Command) -> Option<u8> {
    match cmd {
        Command::CommandLong { target_sys, .. } => *target_sys,
        Command::SetMode { target_sys, .. } => *target_sys,
        Command::Heartbeat { target_sys } => *target_sys,
        Command::RequestDataStream { target_sys, .. } => *target_sys,
        Command::MissionUpload { sysid, .. } => Some(*sysid),
        Command::DownloadMission { sysid, .. } => Some(*sysid),
        Command::LoadWaypoints { .. } => None,
    }
}

fn gcs_header(gcs_sysid: u8, gcs_compid: u8) -> MavHeader {
    MavHeader {
        system_id: gcs_sysid,
        component_id: gcs_compid,
        sequence: 0,
    }
}

fn encode(cmd: &Command, gcs_sysid: u8, gcs_compid: u8) -> Result<Vec<u8>, CommandError> {
    let header = gcs_header(gcs_sysid, gcs_compid);
    let msg = match cmd {
        Command::CommandLong {
            target_sys,
            target_comp,
            command,
            params,
        } => MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: target_sys.unwrap_or(0),
            target_component: target_comp.unwrap_or(1),
            command: *command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        }),
        Command::SetMode {
            target_sys,
            base_mode,
            custom_mode,
        } => MavMessage::SET_MODE(SET_MODE_DATA {
            target_system: target_sys.unwrap_or(0),
            base_mode: MavModeFlag::from_bits_truncate(*base_mode),
            custom_mode: *custom_mode,
        }),
        Command::Heartbeat { .. } => MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        }),
        Command::RequestDataStream {
            target_sys,
            stream_id,
            rate_hz,
            start,
        } => MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            target_system: target_sys.unwrap_or(0),
            target_component: 1,
            req_stream_id: *stream_id,
            req_message_rate: *rate_hz,
            start_stop: if *start { 1 } else { 0 },
        }),
        Command::MissionUpload { .. } | Command::DownloadMission { .. } | Command::LoadWaypoints { .. } => {
            return Err(CommandError::UnknownShape("handled by mission manager, not the generic encoder".into()));
        }
    };

    let mut buf = Vec::new();
    mavlink::write_versioned_msg(&mut buf, MavlinkVersion::V2, header, &msg)
        .map_err(|e| CommandError::UnknownShape(format!("encode failed: {:?}", e)))?;
    Ok(buf)
}
