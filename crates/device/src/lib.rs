//! Device discovery and change notification (§3, §4.2, §4.6).
//!
//! [`record`] defines the immutable-after-sealing `DeviceRecord`
//! snapshot; [`enumerator`] performs the one-shot `/sys` walk that
//! populates a cache at startup; [`monitor`] reads the live kernel
//! uevent stream that keeps it current; [`db`] reads the persistent
//! per-device database the enumerator merges in; [`legacy`] is a
//! field-name compatibility shim for older call sites.

pub mod db;
pub mod enumerator;
pub mod legacy;
pub mod monitor;
pub mod record;

pub use db::{DbEntry, DEFAULT_DB_ROOT};
pub use enumerator::{enumerate, EnumeratorError};
pub use legacy::LegacyDevice;
pub use monitor::{decode_payload, DeviceMonitor, MonitorError, MonitorEvent, UEVENT_GROUP_KERNEL};
pub use record::{
    device_id_for, Action, DeviceRecord, DeviceRecordBuilder, Devnum, PropertyMap, RecordError, DEFAULT_SYS_ROOT,
};
