use crate::packet::{device_id_for_sysid, Device};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Thread-safe sysid -> device mapping. Entries are created on first sight
/// and never evicted for the life of the process.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<u8, Device>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Create-or-update the entry for `sysid`, recording that it has been
    /// seen on `transport_name`. Returns the stable `device_id` and whether
    /// this sysid was newly discovered.
    pub async fn upsert(&self, sysid: u8, transport_name: &str, compid: Option<u8>) -> (String, bool) {
        let now = crate::packet::Packet::now_secs();
        let mut devices = self.devices.write().await;
        let is_new = !devices.contains_key(&sysid);
        let entry = devices.entry(sysid).or_insert_with(|| Device {
            device_id: device_id_for_sysid(sysid),
            sysid,
            compid,
            transports_seen: Default::default(),
            first_seen: now,
            last_seen: now,
        });
        entry.transports_seen.insert(transport_name.to_string());
        entry.last_seen = now;
        if compid.is_some() {
            entry.compid = compid;
        }
        (entry.device_id.clone(), is_new)
    }

    pub async fn transports_for(&self, device_id: &str) -> Vec<String> {
        let devices = self.devices.read().await;
        devices
            .values()
            .find(|d| d.device_id == device_id)
            .map(|d| d.transports_seen.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn sysid_for_device(&self, device_id: &str) -> Option<u8> {
        let devices = self.devices.read().await;
        devices.values().find(|d| d.device_id == device_id).map(|d| d.sysid)
    }

    pub async fn has_observed_gcs(&self, transport_name: &str) -> bool {
        let devices = self.devices.read().await;
        devices
            .values()
            .any(|d| d.sysid >= 250 && d.transports_seen.contains(transport_name))
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        let devices = self.devices.read().await;
        let map: serde_json::Map<String, serde_json::Value> = devices
            .values()
            .map(|d| {
                (
                    d.device_id.clone(),
                    json!({
                        "sysid": d.sysid,
                        "compid": d.compid,
                        "transports": d.transports_seen.iter().cloned().collect::<Vec<_>>(),
                        "first_seen": d.first_seen,
                        "last_seen": d.last_seen,
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn device_id_for_sysid(sysid: u8) -> String {
        device_id_for_sysid(sysid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let reg = DeviceRegistry::new();
        let (id1, new1) = reg.upsert(3, "udp_14550", Some(1)).await;
        assert_eq!(id1, "mav_sys3");
        assert!(new1);

        let (id2, new2) = reg.upsert(3, "udp_14560", None).await;
        assert_eq!(id2, "mav_sys3");
        assert!(!new2);

        let transports = reg.transports_for("mav_sys3").await;
        assert_eq!(transports.len(), 2);
    }

    #[tokio::test]
    async fn gcs_observed_flag_tracks_sysid_range() {
        let reg = DeviceRegistry::new();
        reg.upsert(3, "udp_a", None).await;
        assert!(!reg.has_observed_gcs("udp_a").await);
        reg.upsert(251, "udp_a", None).await;
        assert!(reg.has_observed_gcs("udp_a").await);
    }
}
