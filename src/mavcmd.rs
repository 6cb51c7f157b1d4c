//! Resolution between the numeric/symbolic MAV_CMD identities MQTT clients
//! send and the `mavlink` crate's generated `MavCmd` enum.
//!
//! The crate's dialect doesn't expose a public numeric->enum conversion for
//! `MavCmd`, so this table covers the commands this bridge actually issues
//! (`COMMAND_LONG`, `SET_MODE`, and mission items) plus the common waypoint
//! verbs. Unmapped numeric codes fall back to `MAV_CMD_NAV_WAYPOINT`, which
//! is observable: a mismatched command in a mission item is caught by the
//! upload round-trip hash check (§4.6).

use mavlink::ardupilotmega::MavCmd;

/// Numeric MAV_CMD code backing a resolved enum variant. `MavCmd` is a
/// fieldless enum with explicit discriminants matching the MAVLink command
/// ids, so the cast is exact for every variant the dialect defines.
pub fn to_number(cmd: MavCmd) -> u16 {
    cmd as u16
}

pub fn from_number(code: u16) -> MavCmd {
    match code {
        16 => MavCmd::MAV_CMD_NAV_WAYPOINT,
        20 => MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
        21 => MavCmd::MAV_CMD_NAV_LAND,
        22 => MavCmd::MAV_CMD_NAV_TAKEOFF,
        176 => MavCmd::MAV_CMD_DO_SET_MODE,
        183 => MavCmd::MAV_CMD_DO_SET_SERVO,
        300 => MavCmd::MAV_CMD_MISSION_START,
        400 => MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
        512 => MavCmd::MAV_CMD_REQUEST_MESSAGE,
        511 => MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
        _ => MavCmd::MAV_CMD_NAV_WAYPOINT,
    }
}

/// The command names this table can resolve, for the manifest's
/// `supported_commands` field.
pub const KNOWN_NAMES: &[&str] = &[
    "MAV_CMD_NAV_WAYPOINT",
    "MAV_CMD_NAV_RETURN_TO_LAUNCH",
    "MAV_CMD_NAV_LAND",
    "MAV_CMD_NAV_TAKEOFF",
    "MAV_CMD_DO_SET_MODE",
    "MAV_CMD_DO_SET_SERVO",
    "MAV_CMD_MISSION_START",
    "MAV_CMD_COMPONENT_ARM_DISARM",
    "MAV_CMD_REQUEST_MESSAGE",
    "MAV_CMD_SET_MESSAGE_INTERVAL",
];

pub fn from_name(name: &str) -> Option<MavCmd> {
    let upper = name.to_uppercase();
    let upper = if upper.starts_with("MAV_CMD_") {
        upper
    } else {
        format!("MAV_CMD_{}", upper)
    };
    match upper.as_str() {
        "MAV_CMD_NAV_WAYPOINT" => Some(MavCmd::MAV_CMD_NAV_WAYPOINT),
        "MAV_CMD_NAV_RETURN_TO_LAUNCH" => Some(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH),
        "MAV_CMD_NAV_LAND" => Some(MavCmd::MAV_CMD_NAV_LAND),
        "MAV_CMD_NAV_TAKEOFF" => Some(MavCmd::MAV_CMD_NAV_TAKEOFF),
        "MAV_CMD_DO_SET_MODE" => Some(MavCmd::MAV_CMD_DO_SET_MODE),
        "MAV_CMD_DO_SET_SERVO" => Some(MavCmd::MAV_CMD_DO_SET_SERVO),
        "MAV_CMD_MISSION_START" => Some(MavCmd::MAV_CMD_MISSION_START),
        "MAV_CMD_COMPONENT_ARM_DISARM" => Some(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM),
        "MAV_CMD_REQUEST_MESSAGE" => Some(MavCmd::MAV_CMD_REQUEST_MESSAGE),
        "MAV_CMD_SET_MESSAGE_INTERVAL" => Some(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL),
        _ => None,
    }
}

/// MQTT commands carry either `{command: <u16>}` or `{command: "<NAME>"}`;
/// resolve both forms to the same enum, per REDESIGN FLAG guidance.
pub fn resolve(value: &serde_json::Value) -> Option<MavCmd> {
    if let Some(n) = value.as_u64() {
        return Some(from_number(n as u16));
    }
    if let Some(s) = value.as_str() {
        return from_name(s);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_numeric_and_named_command_to_the_same_enum() {
        let numeric = resolve(&serde_json::json!(400)).unwrap();
        let named = resolve(&serde_json::json!("MAV_CMD_COMPONENT_ARM_DISARM")).unwrap();
        assert!(matches!(numeric, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM));
        assert!(matches!(named, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM));
    }

    #[test]
    fn accepts_name_without_prefix() {
        let named = resolve(&serde_json::json!("component_arm_disarm")).unwrap();
        assert!(matches!(named, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM));
    }
}
