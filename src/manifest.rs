//! Builds the retained `{root}/bridge/manifest` document: what the bridge is
//! configured to talk to, what it has seen so far, and the topic shapes a
//! subscriber should expect. Republished on startup, on every device
//! discovery, and on every MQTT reconnect.

use crate::config::{RouteConfig, RouteTarget, TransportConfig};
use crate::mavcmd;
use crate::registry::DeviceRegistry;
use serde_json::{json, Value as JsonValue};

pub async fn build(
    root: &str,
    gcs_sysid: u8,
    gcs_compid: u8,
    transports: &[TransportConfig],
    routes: &[RouteConfig],
    registry: &DeviceRegistry,
) -> JsonValue {
    json!({
        "schema": "wayfarer-bridge/manifest/v1",
        "gcs": {"sysid": gcs_sysid, "compid": gcs_compid},
        "topics": topic_templates(root),
        "transports": transports.iter().map(transport_json).collect::<Vec<_>>(),
        "routes": routes.iter().map(route_json).collect::<Vec<_>>(),
        "devices": registry.snapshot().await,
        "supported_commands": supported_commands(),
    })
}

fn topic_templates(root: &str) -> JsonValue {
    json!({
        "manifest": format!("{}/bridge/manifest", root),
        "status": format!("{}/bridge/status", root),
        "discovery": format!("{}/devices/{{device_id}}/telem/state/discovery", root),
        "heartbeat": format!("{}/devices/{{device_id}}/telem/state/heartbeat", root),
        "raw": format!("{}/devices/{{device_id}}/telem/raw/mavlink/{{msg_type}}", root),
        "attitude": format!("{}/devices/{{device_id}}/telem/pose/attitude", root),
        "analytics": "sources/source_sysid_{sysid}/source_compid_{compid}/dest_sysid_{dest_sysid}/dest_compid_{dest_compid}/{msg_type}/{port}",
        "cmd_global": format!("{}/cmd/{{action}}", root),
        "cmd_device": format!("{}/devices/{{device_id}}/cmd/{{action}}", root),
        "mission_upload": format!("{}/mission/upload", root),
        "command_ack": "command/{sysid}/{compid}/ack",
        "mission_downloaded": "Nomad/missions/downloaded/{sysid}",
        "waypoint_validation": "Nomad/waypoints/{filename}/validation",
    })
}

fn transport_json(t: &TransportConfig) -> JsonValue {
    json!({
        "name": t.name,
        "kind": format!("{:?}", t.kind),
        "endpoint": t.endpoint,
    })
}

fn route_json(r: &RouteConfig) -> JsonValue {
    json!({
        "from": r.from,
        "to": r.to.iter().map(route_target_json).collect::<Vec<_>>(),
        "dedupe_window_s": r.dedupe_window_s,
    })
}

fn route_target_json(t: &RouteTarget) -> JsonValue {
    match t {
        RouteTarget::Udp { udp } => json!({"udp": udp}),
        RouteTarget::Port { to_port } => json!({"to_port": to_port}),
    }
}

/// The MAV_CMD names `mavcmd` can resolve by name or number. A command
/// outside this list still gets encoded, but falls back to NAV_WAYPOINT,
/// so subscribers should prefer names from here.
fn supported_commands() -> &'static [&'static str] {
    mavcmd::KNOWN_NAMES
}
