use std::collections::HashMap;

use crate::transport::Advertisement;

/// A peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Stable per-radio-session identifier.
    pub id: String,
    /// Local name of the device
    pub name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
        }
    }

    /// Whether the device advertised a non-empty name.
    pub fn has_name(&self) -> bool {
        self.name.as_deref().map_or(false, |name| !name.is_empty())
    }

    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unnamed Device",
        }
    }
}

impl From<Advertisement> for DiscoveredDevice {
    fn from(adv: Advertisement) -> Self {
        Self {
            id: adv.id,
            name: adv.name,
            rssi: adv.rssi,
        }
    }
}

/// Result of inserting into a [`DeviceSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    New,
    Updated,
    Unchanged,
}

/// Insertion-ordered set of discovered devices keyed by id.
#[derive(Debug, Default, Clone)]
pub struct DeviceSet {
    order: Vec<String>,
    devices: HashMap<String, DiscoveredDevice>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device or refreshes the last-seen attributes of a known one.
    /// A missing name or RSSI never erases a previously seen value.
    pub fn insert(&mut self, device: DiscoveredDevice) -> Insertion {
        match self.devices.get_mut(&device.id) {
            Some(existing) => {
                let mut updated = existing.clone();
                if device.name.is_some() {
                    updated.name = device.name;
                }
                if device.rssi.is_some() {
                    updated.rssi = device.rssi;
                }

                if updated == *existing {
                    Insertion::Unchanged
                } else {
                    *existing = updated;
                    Insertion::Updated
                }
            }
            None => {
                self.order.push(device.id.clone());
                self.devices.insert(device.id.clone(), device);
                Insertion::New
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.devices.clear();
    }

    /// Devices in the order they were first seen.
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.order.iter().filter_map(|id| self.devices.get(id))
    }

    /// Devices that would be shown in a user-facing list.
    pub fn named(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.iter().filter(|device| device.has_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esp(id: &str, rssi: Option<i16>) -> DiscoveredDevice {
        DiscoveredDevice::new(id, Some("ESP32-X".into()), rssi)
    }

    #[test]
    fn test_duplicate_ids_collapse() {
        let mut set = DeviceSet::new();
        assert_eq!(set.insert(esp("A", None)), Insertion::New);
        assert_eq!(set.insert(esp("A", None)), Insertion::Unchanged);

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("A").map(|d| d.display_name()), Some("ESP32-X"));
    }

    #[test]
    fn test_repeated_ids_never_duplicate() {
        let mut set = DeviceSet::new();
        let ids = ["A", "B", "A", "C", "B", "A", "C", "D", "A"];
        for (rssi, id) in ids.iter().enumerate() {
            set.insert(esp(id, Some(-(rssi as i16))));
        }

        let seen: Vec<_> = set.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(seen, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_last_seen_attributes_update() {
        let mut set = DeviceSet::new();
        set.insert(esp("A", Some(-80)));
        assert_eq!(set.insert(esp("A", Some(-40))), Insertion::Updated);
        assert_eq!(set.get("A").and_then(|d| d.rssi), Some(-40));

        // Later advertisement without a name keeps the known one.
        set.insert(DiscoveredDevice::new("A", None, Some(-42)));
        assert_eq!(set.get("A").and_then(|d| d.name.clone()), Some("ESP32-X".into()));
    }

    #[test]
    fn test_unnamed_devices_collected_but_not_surfaced() {
        let mut set = DeviceSet::new();
        set.insert(DiscoveredDevice::new("X", None, Some(-70)));
        set.insert(DiscoveredDevice::new("Y", Some(String::new()), None));
        set.insert(esp("A", None));

        assert_eq!(set.len(), 3);
        let named: Vec<_> = set.named().map(|d| d.id.as_str()).collect();
        assert_eq!(named, vec!["A"]);
        assert_eq!(set.get("X").map(|d| d.display_name()), Some("Unnamed Device"));
    }

    #[test]
    fn test_clear() {
        let mut set = DeviceSet::new();
        set.insert(esp("A", None));
        set.clear();
        assert!(set.is_empty());
        assert!(!set.contains("A"));
    }
}
