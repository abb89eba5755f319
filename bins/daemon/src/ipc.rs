//! D-Bus surface mirroring the kernel uevent stream (§4.8, §6).
//!
//! Signals `{AddDevice, ChangeDevice, RemoveDevice, MoveDevice,
//! OnlineDevice, OfflineDevice}` on `org.freedesktop.device1.Device`
//! at `/org/freedesktop/device1`; the manager object at the same path
//! holds the well-known name `org.freedesktop.device1`.

use std::collections::HashMap;

use device::monitor::MonitorEvent;
use device::record::Action;
use zbus::object_server::SignalEmitter;
use zbus::{connection, interface};

pub struct Manager;

#[interface(name = "org.freedesktop.device1.Manager")]
impl Manager {}

pub struct DeviceSignals;

#[interface(name = "org.freedesktop.device1.Device")]
impl DeviceSignals {
    #[zbus(signal)]
    pub async fn add_device(emitter: &SignalEmitter<'_>, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn change_device(emitter: &SignalEmitter<'_>, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn remove_device(emitter: &SignalEmitter<'_>, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn move_device(
        emitter: &SignalEmitter<'_>,
        seqnum: u64,
        old_devpath: String,
        properties: HashMap<String, String>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn online_device(emitter: &SignalEmitter<'_>, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn offline_device(emitter: &SignalEmitter<'_>, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;
}

const OBJECT_PATH: &str = "/org/freedesktop/device1";

/// Owns the bus connection and the objects registered on it. Dropping
/// this releases the well-known name.
pub struct Bus {
    connection: connection::Connection,
}

impl Bus {
    pub async fn connect(well_known_name: &str) -> zbus::Result<Self> {
        let connection = connection::Builder::system()?
            .name(well_known_name.to_string())?
            .serve_at(OBJECT_PATH, Manager)?
            .serve_at(OBJECT_PATH, DeviceSignals)?
            .build()
            .await?;
        Ok(Self { connection })
    }

    /// Emit the signal matching `event.action`, carrying its seqnum,
    /// optional old devpath (`MoveDevice` only), and property map.
    pub async fn emit(&self, event: &MonitorEvent) -> zbus::Result<()> {
        let iface_ref = self
            .connection
            .object_server()
            .interface::<_, DeviceSignals>(OBJECT_PATH)
            .await?;
        let emitter = iface_ref.signal_emitter();

        let properties: HashMap<String, String> = event
            .record
            .properties()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        match event.action {
            Action::Add => DeviceSignals::add_device(emitter, event.seqnum, properties).await,
            Action::Change => DeviceSignals::change_device(emitter, event.seqnum, properties).await,
            Action::Remove => DeviceSignals::remove_device(emitter, event.seqnum, properties).await,
            Action::Move => {
                DeviceSignals::move_device(
                    emitter,
                    event.seqnum,
                    event.old_devpath.clone().unwrap_or_default(),
                    properties,
                )
                .await
            }
            Action::Online => DeviceSignals::online_device(emitter, event.seqnum, properties).await,
            Action::Offline => DeviceSignals::offline_device(emitter, event.seqnum, properties).await,
        }
    }
}
