//! Device catalog - the externally-owned registry of tracked units.
//!
//! The catalog is read-only to the tracking core. It is supplied by an
//! external system (the fleet operator's database) and replaced wholesale
//! when devices are added or removed; the ingestor diffs topic sets across
//! replacements to drive re-subscription.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable identifier for a tracked device.
pub type DeviceId = String;

/// Which per-device topic a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// GPS position updates.
    Position,
    /// On-board passenger counter.
    PassengerCount,
    /// Battery voltage reports.
    Battery,
}

/// The vehicle a device is installed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedBus {
    pub plate_number: String,
    pub driver: String,
    pub conductor: String,
    pub capacity: u32,
}

/// A telemetry-emitting unit installed in one vehicle.
///
/// Immutable for the lifetime of a tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub gps_topic: String,
    pub passenger_count_topic: String,
    pub battery_topic: String,
    pub assigned_bus: AssignedBus,
}

impl Device {
    /// All topics the ingestor subscribes to for this device.
    pub fn topics(&self) -> [&str; 3] {
        [
            &self.gps_topic,
            &self.passenger_count_topic,
            &self.battery_topic,
        ]
    }
}

/// Immutable snapshot of the known device set.
///
/// Wraps the device list with a reverse topic index so the dispatch loop
/// can resolve an incoming topic to `(device, kind)` without scanning.
/// Cheap to clone (`Arc` internals) so the ingestor and service layer can
/// each hold the current generation.
#[derive(Debug, Clone)]
pub struct DeviceCatalog {
    devices: Arc<Vec<Device>>,
    by_topic: Arc<HashMap<String, (DeviceId, TopicKind)>>,
}

impl DeviceCatalog {
    /// Build a catalog from a device list.
    ///
    /// Later devices win if two devices claim the same topic name; the
    /// external catalog is expected to keep topics unique.
    pub fn new(devices: Vec<Device>) -> Self {
        let mut by_topic = HashMap::with_capacity(devices.len() * 3);
        for device in &devices {
            by_topic.insert(
                device.gps_topic.clone(),
                (device.id.clone(), TopicKind::Position),
            );
            by_topic.insert(
                device.passenger_count_topic.clone(),
                (device.id.clone(), TopicKind::PassengerCount),
            );
            by_topic.insert(
                device.battery_topic.clone(),
                (device.id.clone(), TopicKind::Battery),
            );
        }
        Self {
            devices: Arc::new(devices),
            by_topic: Arc::new(by_topic),
        }
    }

    /// Empty catalog; nothing to subscribe to.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Resolve an incoming topic to the owning device and topic kind.
    pub fn resolve_topic(&self, topic: &str) -> Option<(&DeviceId, TopicKind)> {
        self.by_topic.get(topic).map(|(id, kind)| (id, *kind))
    }

    /// Look up a device by id.
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// All devices in catalog order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Every topic across all devices, in catalog order.
    pub fn all_topics(&self) -> Vec<String> {
        self.devices
            .iter()
            .flat_map(|d| d.topics().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Mini-Bus {}", id),
        gps_topic: format!("fleet/{}/gps", id),
        passenger_count_topic: format!("fleet/{}/passengers", id),
        battery_topic: format!("fleet/{}/battery", id),
        assigned_bus: AssignedBus {
            plate_number: format!("ABC-{}", id),
            driver: "Dela Cruz".to_string(),
            conductor: "Santos".to_string(),
            capacity: 20,
        },
    }
}
