//! Field-name compatible adapter over [`DeviceRecord`] (§3 expansion).
//!
//! Some call sites in the wider codebase were written against older
//! accessor names. Rather than rename them at every call site, this
//! module offers a thin wrapper with those names; it holds no data of
//! its own; cloning is the same cheap handle-clone as `DeviceRecord`
//! itself.

use crate::record::{Action, Devnum};
use crate::DeviceRecord;

#[derive(Debug, Clone)]
pub struct LegacyDevice(DeviceRecord);

impl LegacyDevice {
    pub fn new(record: DeviceRecord) -> Self {
        Self(record)
    }

    pub fn inner(&self) -> &DeviceRecord {
        &self.0
    }

    pub fn into_inner(self) -> DeviceRecord {
        self.0
    }

    pub fn devpath(&self) -> &str {
        self.0.devpath()
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.0.subsystem()
    }

    pub fn sysname(&self) -> &str {
        self.0.sysname()
    }

    pub fn syspath(&self) -> &str {
        self.0.syspath()
    }

    pub fn devnode(&self) -> Option<&str> {
        self.0.devnode()
    }

    pub fn devnum(&self) -> Option<Devnum> {
        self.0.devnum()
    }

    pub fn action(&self) -> Option<Action> {
        self.0.action()
    }

    pub fn property_value(&self, key: &str) -> Option<&str> {
        self.0.property(key)
    }
}

impl From<DeviceRecord> for LegacyDevice {
    fn from(record: DeviceRecord) -> Self {
        Self(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_accessors_through_to_the_record() {
        let record = DeviceRecord::from_syspath("/sys", "/sys/class/net/eth0").unwrap();
        let legacy = LegacyDevice::new(record.clone());

        assert_eq!(legacy.devpath(), record.devpath());
        assert_eq!(legacy.sysname(), record.sysname());
        assert_eq!(legacy.syspath(), record.syspath());
    }
}
