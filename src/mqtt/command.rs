use crate::error::CommandError;
use crate::mavcmd;
use crate::packet::MissionItem;
use mavlink::ardupilotmega::MavCmd;
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// One waypoint as it arrives from an MQTT `load_waypoints`/`mission/upload`
/// payload, before normalization into a `MISSION_ITEM_INT`.
#[derive(Debug, Clone, Deserialize)]
pub struct WaypointSpec {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub alt: Option<f64>,
    pub z: Option<f64>,
    #[serde(default)]
    pub frame: Option<u8>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub command: Option<u16>,
    #[serde(default)]
    pub params: Option<[f32; 4]>,
}

impl WaypointSpec {
    /// Normalize into a mission item: lat/lon (or x/y) * 1e7 for the int
    /// frame, alt (or z) in meters.
    pub fn into_item(self, seq: u16) -> MissionItem {
        let lat = self.lat.or(self.x).unwrap_or(0.0);
        let lon = self.lon.or(self.y).unwrap_or(0.0);
        let alt = self.alt.or(self.z).unwrap_or(0.0);
        let frame = self.frame.unwrap_or(6);
        let params = self.params.unwrap_or([0.0; 4]);
        MissionItem {
            seq,
            frame,
            command: self.command.unwrap_or(16),
            current: if seq == 0 { 1 } else { 0 },
            autocontinue: 1,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            x: (lat * 1e7) as i32,
            y: (lon * 1e7) as i32,
            z: alt as f32,
        }
    }
}

/// Tagged command variants decoded from an MQTT command payload. Replaces
/// the dynamic isinstance/duck-typing style of dispatch with an explicit
/// sum type resolved once at the edge.
#[derive(Debug, Clone)]
pub enum Command {
    CommandLong {
        target_sys: Option<u8>,
        target_comp: Option<u8>,
        command: MavCmd,
        params: [f32; 7],
    },
    SetMode {
        target_sys: Option<u8>,
        base_mode: u8,
        custom_mode: u32,
    },
    MissionUpload {
        sysid: u8,
        items: Vec<WaypointSpec>,
    },
    Heartbeat {
        target_sys: Option<u8>,
    },
    RequestDataStream {
        target_sys: Option<u8>,
        stream_id: u8,
        rate_hz: u16,
        start: bool,
    },
    LoadWaypoints {
        filename: String,
        waypoints: Vec<WaypointSpec>,
    },
    DownloadMission {
        sysid: u8,
        target_comp: u8,
    },
}

/// Splits a bare `command/{sysid}/{compid}/{action}` topic (the non-root
/// family inherited unchanged from the original command channel) into its
/// numeric sysid/compid segments.
fn command_path_ids(topic: &str) -> Option<(u8, u8)> {
    let mut parts = topic.split('/');
    if parts.next()? != "command" {
        return None;
    }
    let sysid = parts.next()?.parse().ok()?;
    let compid = parts.next()?.parse().ok()?;
    Some((sysid, compid))
}

/// The `device_id`/`sysid` a command targets, resolved from the bare
/// `command/{sysid}/{compid}/...` topic family, the `.../devices/<id>/cmd/...`
/// topic family, or the payload.
pub fn resolve_target_sysid(topic: &str, payload: &JsonValue) -> Option<u8> {
    if let Some((sysid, _)) = command_path_ids(topic) {
        return Some(sysid);
    }
    if let Some(rest) = topic.split("/devices/").nth(1) {
        if let Some(id) = rest.split('/').next() {
            if let Some(n) = id.strip_prefix("mav_sys") {
                if let Ok(n) = n.parse() {
                    return Some(n);
                }
            }
        }
    }
    if let Some(sysid) = payload.get("sysid").and_then(|v| v.as_u64()) {
        return Some(sysid as u8);
    }
    if let Some(device_id) = payload.get("device_id").and_then(|v| v.as_str()) {
        if let Some(n) = device_id.strip_prefix("mav_sys") {
            if let Ok(n) = n.parse() {
                return Some(n);
            }
        }
    }
    None
}

/// The target component id, resolved the same way as `resolve_target_sysid`
/// but from path segment 2 rather than segment 1.
pub fn resolve_target_compid(topic: &str, payload: &JsonValue) -> Option<u8> {
    if let Some((_, compid)) = command_path_ids(topic) {
        return Some(compid);
    }
    payload.get("target_comp").and_then(|v| v.as_u64()).map(|v| v as u8)
}

fn msg_type(payload: &JsonValue) -> Option<String> {
    payload
        .get("msg_type")
        .or_else(|| payload.get("msg"))
        .or_else(|| payload.get("action"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_uppercase())
}

/// Best-effort shape name for an MQTT command payload that failed to decode
/// into a `Command`, so the rejection ack can still report `msg_type`.
pub fn peek_msg_type(payload: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(payload).ok()?;
    msg_type(&value)
}

pub fn decode(topic: &str, payload: &[u8]) -> Result<Command, CommandError> {
    let value: JsonValue = serde_json::from_slice(payload)?;
    let shape = msg_type(&value).ok_or_else(|| CommandError::UnknownShape("missing msg_type".into()))?;

    match shape.as_str() {
        "COMMAND_LONG" => {
            let command = value
                .get("command")
                .and_then(mavcmd::resolve)
                .ok_or_else(|| CommandError::UnknownMavCmd(format!("{:?}", value.get("command"))))?;
            let mut params = [0f32; 7];
            if let Some(arr) = value.get("params").and_then(|v| v.as_array()) {
                for (i, p) in arr.iter().take(7).enumerate() {
                    params[i] = p.as_f64().unwrap_or(0.0) as f32;
                }
            }
            Ok(Command::CommandLong {
                target_sys: resolve_target_sysid(topic, &value),
                target_comp: resolve_target_compid(topic, &value),
                command,
                params,
            })
        }
        "SET_MODE" => Ok(Command::SetMode {
            target_sys: resolve_target_sysid(topic, &value),
            base_mode: value.get("base_mode").and_then(|v| v.as_u64()).unwrap_or(0) as u8,
            custom_mode: value.get("custom_mode").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        }),
        "MISSION_UPLOAD" => {
            let sysid = resolve_target_sysid(topic, &value)
                .ok_or(CommandError::NoTarget)?;
            let items: Vec<WaypointSpec> = value
                .get("mission_items")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            Ok(Command::MissionUpload { sysid, items })
        }
        "HEARTBEAT" => Ok(Command::Heartbeat {
            target_sys: resolve_target_sysid(topic, &value),
        }),
        "REQUEST_DATA_STREAM" => Ok(Command::RequestDataStream {
            target_sys: resolve_target_sysid(topic, &value),
            stream_id: value.get("stream_id").and_then(|v| v.as_u64()).unwrap_or(0) as u8,
            rate_hz: value.get("rate_hz").and_then(|v| v.as_u64()).unwrap_or(1) as u16,
            start: value.get("start").and_then(|v| v.as_bool()).unwrap_or(true),
        }),
        "LOAD_WAYPOINTS" => {
            let filename = value
                .get("filename")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CommandError::UnknownShape("load_waypoints missing filename".into()))?
                .to_string();
            let waypoints: Vec<WaypointSpec> = value
                .get("waypoints")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            Ok(Command::LoadWaypoints { filename, waypoints })
        }
        "DOWNLOAD_MISSION" => {
            let sysid = resolve_target_sysid(topic, &value).ok_or(CommandError::NoTarget)?;
            let target_comp = value.get("target_comp").and_then(|v| v.as_u64()).unwrap_or(1) as u8;
            Ok(Command::DownloadMission { sysid, target_comp })
        }
        other => Err(CommandError::UnknownShape(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_command_long_with_numeric_mav_cmd() {
        let payload = br#"{"msg":"COMMAND_LONG","command":400,"params":[1,0,0,0,0,0,0]}"#;
        let cmd = decode("wayfarer/v1/cmd/details", payload).unwrap();
        match cmd {
            Command::CommandLong { command, params, .. } => {
                assert!(matches!(command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM));
                assert_eq!(params[0], 1.0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn resolves_target_from_bare_command_topic() {
        let payload = br#"{"msg_type":"COMMAND_LONG","command":400,"params":[1,0,0,0,0,0,0]}"#;
        let cmd = decode("command/3/1/details", payload).unwrap();
        match cmd {
            Command::CommandLong { target_sys, target_comp, .. } => {
                assert_eq!(target_sys, Some(3));
                assert_eq!(target_comp, Some(1));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn resolves_target_from_topic_path() {
        let payload = br#"{"msg_type":"HEARTBEAT"}"#;
        let value: JsonValue = serde_json::from_slice(payload).unwrap();
        let sysid = resolve_target_sysid("wayfarer/v1/devices/mav_sys3/cmd/details", &value);
        assert_eq!(sysid, Some(3));
    }

    #[test]
    fn waypoint_spec_scales_lat_lon_to_int_frame() {
        let spec = WaypointSpec {
            lat: Some(37.4125),
            lon: Some(-121.998),
            x: None,
            y: None,
            alt: Some(55.0),
            z: None,
            frame: Some(6),
            action: None,
            command: None,
            params: None,
        };
        let item = spec.into_item(0);
        assert_eq!(item.x, 374125000);
        assert_eq!(item.y, -1219980000);
        assert_eq!(item.z, 55.0);
    }

    #[test]
    fn rejects_unknown_shape() {
        let payload = br#"{"msg_type":"NOT_A_REAL_COMMAND"}"#;
        assert!(decode("wayfarer/v1/cmd/x", payload).is_err());
    }
}
