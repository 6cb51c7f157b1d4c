//! Periodic GCS identity beacon, injected onto every transport so vehicles
//! see a live ground station even when no operator command is in flight.

use crate::router::Router;
use mavlink::ardupilotmega::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
};
use mavlink::{MavHeader, MavlinkVersion};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub async fn run(router: Arc<Router>, gcs_sysid: u8, gcs_compid: u8, interval_secs: f64) {
    let sequence = AtomicU32::new(0);
    let mut tick = tokio::time::interval(Duration::from_secs_f64(interval_secs.max(0.05)));
    loop {
        tick.tick().await;
        let header = MavHeader {
            system_id: gcs_sysid,
            component_id: gcs_compid,
            sequence: sequence.fetch_add(1, Ordering::Relaxed) as u8,
        };
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        let mut buf = Vec::new();
        if let Err(e) = mavlink::write_versioned_msg(&mut buf, MavlinkVersion::V2, header, &msg) {
            warn!("failed to encode GCS heartbeat: {}", e);
            continue;
        }
        router.broadcast(&buf).await;
    }
}
