use crate::error::MissionError;
use crate::packet::{DownloadPhase, DownloadState, MissionItem, UploadPhase, UploadState};
use crate::registry::DeviceRegistry;
use crate::router::Router;
use mavlink::ardupilotmega::{
    MavFrame, MavMissionResult, MavMissionType, MavMessage, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_INT_DATA, MISSION_REQUEST_INT_DATA, MISSION_REQUEST_LIST_DATA,
};
use mavlink::{MavHeader, MavlinkVersion};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

const FSM_TIMEOUT: Duration = Duration::from_secs(30);

/// Result topics the bridge publishes as upload/download FSMs progress.
#[derive(Debug, Clone)]
pub struct MissionStatus {
    pub sysid: u8,
    pub topic_suffix: &'static str,
    pub payload: JsonValue,
}

pub struct MissionManager {
    router: Arc<Router>,
    registry: Arc<DeviceRegistry>,
    gcs_sysid: u8,
    gcs_compid: u8,
    uploads: RwLock<HashMap<u8, UploadState>>,
    downloads: RwLock<HashMap<u8, DownloadState>>,
    status_tx: mpsc::Sender<MissionStatus>,
}

impl MissionManager {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<DeviceRegistry>,
        gcs_sysid: u8,
        gcs_compid: u8,
        status_tx: mpsc::Sender<MissionStatus>,
    ) -> Self {
        Self {
            router,
            registry,
            gcs_sysid,
            gcs_compid,
            uploads: RwLock::new(HashMap::new()),
            downloads: RwLock::new(HashMap::new()),
            status_tx,
        }
    }

    fn header(&self) -> MavHeader {
        MavHeader {
            system_id: self.gcs_sysid,
            component_id: self.gcs_compid,
            sequence: 0,
        }
    }

    async fn send(&self, sysid: u8, msg: &MavMessage) {
        let device_id = DeviceRegistry::device_id_for_sysid(sysid);
        let mut buf = Vec::new();
        if let Err(e) = mavlink::write_versioned_msg(&mut buf, MavlinkVersion::V2, self.header(), msg) {
            warn!("mission manager: failed to encode message for sysid {}: {}", sysid, e);
            return;
        }
        if !self.router.send_to_device(&device_id, &buf).await {
            warn!("mission manager: no transport known for sysid {} yet", sysid);
        }
    }

    async fn publish(&self, sysid: u8, topic_suffix: &'static str, payload: JsonValue) {
        let _ = self
            .status_tx
            .send(MissionStatus {
                sysid,
                topic_suffix,
                payload,
            })
            .await;
    }

    // ---- Upload FSM (GCS -> vehicle) ----

    pub async fn start_upload(
        &self,
        sysid: u8,
        target_compid: u8,
        mission: Vec<MissionItem>,
        expected_hash: Option<String>,
    ) {
        let count = mission.len() as u16;
        let now = Instant::now();
        let preempted = {
            let mut uploads = self.uploads.write().await;
            let preempted = uploads
                .get(&sysid)
                .map(|s| matches!(s.phase, UploadPhase::SendingCount | UploadPhase::SendingItems))
                .unwrap_or(false);
            uploads.insert(
                sysid,
                UploadState {
                    phase: UploadPhase::SendingCount,
                    mission,
                    acked_seqs: Default::default(),
                    started_at: now,
                    last_activity: now,
                    target_compid,
                    expected_hash,
                },
            );
            preempted
        };
        if preempted {
            let reason = MissionError::Aborted("superseded by a new upload".into());
            self.publish(sysid, "uploaded/status", json!({"status": "failed", "reason": reason.to_string()}))
                .await;
        }
        let msg = MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            target_system: sysid,
            target_component: target_compid,
            count,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        });
        self.send(sysid, &msg).await;
        self.uploads
            .write()
            .await
            .get_mut(&sysid)
            .map(|s| s.phase = UploadPhase::SendingItems);
    }

    pub async fn on_mission_request(&self, sysid: u8, seq: u16) {
        let item = {
            let mut uploads = self.uploads.write().await;
            let Some(state) = uploads.get_mut(&sysid) else {
                return;
            };
            if state.phase != UploadPhase::SendingItems {
                return;
            }
            state.last_activity = Instant::now();
            state.acked_seqs.insert(seq);
            state.mission.iter().find(|m| m.seq == seq).cloned()
        };
        let Some(item) = item else {
            warn!("upload FSM for sysid {}: {}", sysid, MissionError::UnexpectedSeq { got: seq });
            return;
        };
        let compid = self
            .uploads
            .read()
            .await
            .get(&sysid)
            .map(|s| s.target_compid)
            .unwrap_or(1);
        let msg = MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            target_system: sysid,
            target_component: compid,
            seq: item.seq,
            frame: frame_from_u8(item.frame),
            current: item.current,
            autocontinue: item.autocontinue,
            param1: item.param1,
            param2: item.param2,
            param3: item.param3,
            param4: item.param4,
            x: item.x,
            y: item.y,
            z: item.z,
            command: crate::mavcmd::from_number(item.command),
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        });
        self.send(sysid, &msg).await;
    }

    pub async fn on_mission_ack(&self, sysid: u8, ack: &MISSION_ACK_DATA) {
        if ack.mavtype != MavMissionResult::MAV_MISSION_ACCEPTED {
            if let Some(state) = self.uploads.write().await.get_mut(&sysid) {
                state.phase = UploadPhase::Failed;
            }
            self.publish(
                sysid,
                "uploaded/status",
                json!({"status": "failed", "reason": format!("{:?}", ack.mavtype)}),
            )
            .await;
            return;
        }
        let result = {
            let mut uploads = self.uploads.write().await;
            let Some(state) = uploads.get_mut(&sysid) else {
                return;
            };
            state.last_activity = Instant::now();
            let item_count = state.mission.len();
            let duration = state.started_at.elapsed().as_secs_f64();
            let actual_hash = canonical_hash(&state.mission);
            if let Some(expected) = &state.expected_hash {
                if expected != &actual_hash {
                    state.phase = UploadPhase::Failed;
                    return Some((
                        false,
                        item_count,
                        duration,
                        Some(MissionError::HashMismatch {
                            expected: expected.clone(),
                            actual: actual_hash,
                        }),
                    ));
                }
            }
            state.phase = UploadPhase::Completed;
            Some((true, item_count, duration, None))
        };
        if let Some((ok, item_count, duration, err)) = result {
            let payload = if ok {
                json!({"status": "completed", "duration": duration, "item_count": item_count})
            } else {
                json!({"status": "failed", "reason": err.map(|e| e.to_string())})
            };
            self.publish(sysid, "uploaded/status", payload).await;
        }
    }

    // ---- Download FSM (vehicle -> GCS) ----

    pub async fn start_download(&self, sysid: u8, target_compid: u8) {
        let now = Instant::now();
        self.downloads.write().await.insert(
            sysid,
            DownloadState {
                phase: DownloadPhase::RequestingList,
                mission: Vec::new(),
                count: 0,
                started_at: now,
                last_activity: now,
                target_compid,
            },
        );
        let msg = MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
            target_system: sysid,
            target_component: target_compid,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        });
        self.send(sysid, &msg).await;
    }

    pub async fn on_mission_count(&self, sysid: u8, count: u16) {
        let compid = {
            let mut downloads = self.downloads.write().await;
            let Some(state) = downloads.get_mut(&sysid) else {
                return;
            };
            state.last_activity = Instant::now();
            state.count = count;
            state.mission = vec![None; count as usize];
            if count == 0 {
                state.phase = DownloadPhase::Completed;
            } else {
                state.phase = DownloadPhase::Downloading;
            }
            state.target_compid
        };
        if count == 0 {
            self.publish(
                sysid,
                "downloaded",
                json!({"mission": [], "count": 0, "duration": 0.0}),
            )
            .await;
            return;
        }
        self.request_seq(sysid, compid, 0).await;
    }

    async fn request_seq(&self, sysid: u8, compid: u8, seq: u16) {
        let msg = MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            target_system: sysid,
            target_component: compid,
            seq,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        });
        self.send(sysid, &msg).await;
    }

    pub async fn on_mission_item(&self, sysid: u8, item: MissionItem) {
        let next = {
            let mut downloads = self.downloads.write().await;
            let Some(state) = downloads.get_mut(&sysid) else {
                return;
            };
            if state.phase != DownloadPhase::Downloading {
                return;
            }
            state.last_activity = Instant::now();
            let idx = item.seq as usize;
            if idx >= state.mission.len() {
                warn!("download FSM for sysid {}: {}", sysid, MissionError::UnexpectedSeq { got: item.seq });
                return;
            }
            state.mission[idx] = Some(item);
            let next_hole = state.mission.iter().position(|m| m.is_none());
            match next_hole {
                Some(hole) => Some((false, hole as u16, state.target_compid)),
                None => {
                    state.phase = DownloadPhase::Completed;
                    None
                }
            }
        };

        match next {
            Some((_, hole_seq, compid)) => {
                self.request_seq(sysid, compid, hole_seq).await;
            }
            None => {
                let (mission, duration) = {
                    let downloads = self.downloads.read().await;
                    let state = downloads.get(&sysid).unwrap();
                    (
                        state.mission.iter().flatten().cloned().collect::<Vec<_>>(),
                        state.started_at.elapsed().as_secs_f64(),
                    )
                };
                let hash = canonical_hash(&mission);
                self.publish(
                    sysid,
                    "downloaded",
                    json!({
                        "mission": mission.iter().map(mission_item_json).collect::<Vec<_>>(),
                        "count": mission.len(),
                        "duration": duration,
                        "hash": hash,
                    }),
                )
                .await;
            }
        }
    }

    /// Background loop: fail any FSM that has been inactive past the 30s
    /// timeout.
    pub async fn run_timeout_sweeper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        loop {
            tick.tick().await;
            let timed_out_uploads: Vec<u8> = {
                let uploads = self.uploads.read().await;
                uploads
                    .iter()
                    .filter(|(_, s)| {
                        matches!(s.phase, UploadPhase::SendingCount | UploadPhase::SendingItems)
                            && s.last_activity.elapsed() > FSM_TIMEOUT
                    })
                    .map(|(sysid, _)| *sysid)
                    .collect()
            };
            for sysid in timed_out_uploads {
                self.uploads
                    .write()
                    .await
                    .get_mut(&sysid)
                    .map(|s| s.phase = UploadPhase::Failed);
                let reason = MissionError::Timeout(FSM_TIMEOUT);
                self.publish(sysid, "uploaded/status", json!({"status": "failed", "reason": reason.to_string()}))
                    .await;
            }

            let timed_out_downloads: Vec<u8> = {
                let downloads = self.downloads.read().await;
                downloads
                    .iter()
                    .filter(|(_, s)| {
                        matches!(s.phase, DownloadPhase::RequestingList | DownloadPhase::Downloading)
                            && s.last_activity.elapsed() > FSM_TIMEOUT
                    })
                    .map(|(sysid, _)| *sysid)
                    .collect()
            };
            for sysid in timed_out_downloads {
                self.downloads
                    .write()
                    .await
                    .get_mut(&sysid)
                    .map(|s| s.phase = DownloadPhase::Failed);
                let reason = MissionError::Timeout(FSM_TIMEOUT);
                self.publish(sysid, "downloaded", json!({"status": "failed", "reason": reason.to_string()}))
                    .await;
            }
        }
    }
}

fn frame_from_u8(frame: u8) -> MavFrame {
    match frame {
        0 => MavFrame::MAV_FRAME_GLOBAL,
        3 => MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
        6 => MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
        _ => MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
    }
}

fn frame_to_u8(frame: MavFrame) -> u8 {
    match frame {
        MavFrame::MAV_FRAME_GLOBAL => 0,
        MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT => 3,
        _ => 6,
    }
}

/// Convert an inbound `MISSION_ITEM_INT` (a vehicle reporting a waypoint
/// during download) into our internal representation.
pub fn mission_item_from_int_data(data: &MISSION_ITEM_INT_DATA) -> MissionItem {
    MissionItem {
        seq: data.seq,
        frame: frame_to_u8(data.frame),
        command: crate::mavcmd::to_number(data.command),
        current: data.current,
        autocontinue: data.autocontinue,
        param1: data.param1,
        param2: data.param2,
        param3: data.param3,
        param4: data.param4,
        x: data.x,
        y: data.y,
        z: data.z,
    }
}

fn mission_item_json(item: &MissionItem) -> JsonValue {
    json!({
        "seq": item.seq,
        "command": item.command,
        "x": item.x,
        "y": item.y,
        "z": item.z,
        "param1": item.param1,
        "param2": item.param2,
        "param3": item.param3,
        "param4": item.param4,
        "current": item.current,
        "autocontinue": item.autocontinue,
    })
}

/// Canonicalize a mission (strip `frame`, sort keys, stable numeric types)
/// and SHA-256 it. Used for the upload/download round-trip property.
pub fn canonical_hash(mission: &[MissionItem]) -> String {
    let canonical: Vec<BTreeMap<&'static str, JsonValue>> = mission
        .iter()
        .map(|item| {
            let mut m = BTreeMap::new();
            m.insert("seq", json!(item.seq));
            m.insert("command", json!(item.command));
            m.insert("current", json!(item.current));
            m.insert("autocontinue", json!(item.autocontinue));
            m.insert("param1", json!(item.param1));
            m.insert("param2", json!(item.param2));
            m.insert("param3", json!(item.param3));
            m.insert("param4", json!(item.param4));
            m.insert("x", json!(item.x));
            m.insert("y", json!(item.y));
            m.insert("z", json!(item.z));
            m
        })
        .collect();
    let encoded = serde_json::to_string(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mission() -> Vec<MissionItem> {
        vec![
            MissionItem {
                seq: 0,
                frame: 6,
                command: 16,
                current: 0,
                autocontinue: 1,
                param1: 0.0,
                param2: 0.0,
                param3: 0.0,
                param4: 0.0,
                x: 374125000,
                y: -1219980000,
                z: 55.0,
            },
            MissionItem {
                seq: 1,
                frame: 6,
                command: 16,
                current: 0,
                autocontinue: 1,
                param1: 0.0,
                param2: 0.0,
                param3: 0.0,
                param4: 0.0,
                x: 374130000,
                y: -1219982000,
                z: 60.0,
            },
        ]
    }

    #[test]
    fn round_trip_hash_is_stable() {
        let m = sample_mission();
        let h1 = canonical_hash(&m);
        let h2 = canonical_hash(&m.clone());
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_changes_with_content() {
        let mut m = sample_mission();
        let h1 = canonical_hash(&m);
        m[0].z = 99.0;
        let h2 = canonical_hash(&m);
        assert_ne!(h1, h2);
    }
}
