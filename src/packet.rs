use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// The internal value passed between transport, router, and MQTT adapter.
#[derive(Debug, Clone, Serialize)]
pub struct Packet {
    pub device_id: String,
    pub schema: &'static str,
    pub msg_type: String,
    pub fields: HashMap<String, JsonValue>,
    pub raw_bytes: Option<Vec<u8>>,
    pub timestamp: f64,
    pub origin: String,
    pub src_sysid: Option<u8>,
    pub src_compid: Option<u8>,
    pub dest_sysid: Option<u8>,
    pub dest_compid: Option<u8>,
}

impl Packet {
    pub fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

pub fn device_id_for_sysid(sysid: u8) -> String {
    format!("mav_sys{}", sysid)
}

/// Registry entry for a single observed vehicle/component.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub sysid: u8,
    pub compid: Option<u8>,
    pub transports_seen: HashSet<String>,
    pub first_seen: f64,
    pub last_seen: f64,
}

/// A supervised, named MAVLink endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Open,
}

/// Per-sysid mission upload state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPhase {
    SendingCount,
    SendingItems,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MissionItem {
    pub seq: u16,
    pub frame: u8,
    pub command: u16,
    pub current: u8,
    pub autocontinue: u8,
    pub param1: f32,
    pub param2: f32,
    pub param3: f32,
    pub param4: f32,
    pub x: i32,
    pub y: i32,
    pub z: f32,
}

#[derive(Debug, Clone)]
pub struct UploadState {
    pub phase: UploadPhase,
    pub mission: Vec<MissionItem>,
    pub acked_seqs: HashSet<u16>,
    pub started_at: std::time::Instant,
    pub last_activity: std::time::Instant,
    pub target_compid: u8,
    pub expected_hash: Option<String>,
}

/// Per-sysid mission download state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPhase {
    RequestingList,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DownloadState {
    pub phase: DownloadPhase,
    pub mission: Vec<Option<MissionItem>>,
    pub count: u16,
    pub started_at: std::time::Instant,
    pub last_activity: std::time::Instant,
    pub target_compid: u8,
}
