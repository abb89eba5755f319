use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Default root of the kernel device hierarchy. The enumerator and
/// monitor both take this as a parameter so tests can point it at a
/// fixture directory instead of the real `/sys`.
pub const DEFAULT_SYS_ROOT: &str = "/sys";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("syspath must be rooted at the sys-root prefix: {0}")]
    NotUnderSysRoot(String),

    #[error("derived sys name is empty or equal to the sys root")]
    EmptySysName,

    #[error("devnum present without a known subsystem")]
    DevnumWithoutSubsystem,

    #[error("sealed record is missing a required field: {0}")]
    MissingSealedField(&'static str),
}

/// The action carried by a kernel uevent (or, for the legacy CLI
/// `trigger` path, a manually requested re-emission of `"change"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Change => "change",
            Action::Move => "move",
            Action::Online => "online",
            Action::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Action::Add),
            "remove" => Ok(Action::Remove),
            "change" => Ok(Action::Change),
            "move" => Ok(Action::Move),
            "online" => Ok(Action::Online),
            "offline" => Ok(Action::Offline),
            _ => Err(()),
        }
    }
}

/// The kernel major/minor pair identifying a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Devnum {
    pub major: u32,
    pub minor: u32,
}

/// An insertion-order-preserving string-to-string map, used for
/// device properties. Iteration order is stable across modifications
/// (appending a key that already exists overwrites in place rather
/// than moving it to the end), matching the `I-PROP-ORDER` invariant.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    order: Vec<String>,
    values: std::collections::HashMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(move |k| (k.as_str(), self.values[k].as_str()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct Inner {
    syspath: String,
    devpath: String,
    sysname: String,
    sysnum: Option<String>,

    subsystem: Option<String>,
    devtype: Option<String>,
    driver: Option<String>,
    devnode: Option<String>,
    devnum: Option<Devnum>,
    ifindex: Option<i32>,

    properties: PropertyMap,
    tags: HashSet<String>,
    devlinks: HashSet<String>,
    devlink_priority: i32,
    watch_handle: Option<i32>,

    first_seen_usec: u64,
    uevent_file_consumed: RefCell<bool>,
    db_consumed: RefCell<bool>,

    sealed: bool,
    action: Option<Action>,
    seqnum: Option<u64>,
    old_devpath: Option<String>,

    sys_root: String,
    // Computed on demand and memoized on first *successful* lookup,
    // per the open-question resolution in DESIGN.md: never
    // re-derived, but also never populated speculatively.
    parent: RefCell<Option<Option<DeviceRecord>>>,
}

/// A reference-counted, immutable-after-sealing snapshot of one
/// `/sys` device (§3). Cloning a [`DeviceRecord`] clones the handle;
/// the underlying data is destroyed when the last clone drops.
#[derive(Clone)]
pub struct DeviceRecord(Rc<Inner>);

/// Strips the sys-root prefix from an absolute sys path, producing a
/// devpath that always starts with `/`.
fn derive_devpath(sys_root: &str, syspath: &str) -> Result<String, RecordError> {
    let stripped = syspath
        .strip_prefix(sys_root)
        .ok_or_else(|| RecordError::NotUnderSysRoot(syspath.to_string()))?;
    let devpath = if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    };
    Ok(devpath)
}

/// Final devpath component, with `!` rewritten to `/` (kernel's
/// escaping of device nodes containing slashes, e.g. `bsg!0:0:0:0`),
/// plus any trailing numeric sysnum.
fn derive_sysname_and_num(devpath: &str) -> (String, Option<String>) {
    let last = devpath.rsplit('/').next().unwrap_or("");
    let sysname = last.replace('!', "/");

    let digits_at_end = sysname
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .count();

    if digits_at_end == 0 || digits_at_end == sysname.len() {
        (sysname, None)
    } else {
        let split_at = sysname.len() - digits_at_end;
        let sysnum = sysname[split_at..].to_string();
        (sysname, Some(sysnum))
    }
}

impl DeviceRecord {
    /// Build a device-id builder's worth of derived fields from a raw
    /// syspath, without touching the filesystem. Used by both the
    /// enumerator (which then lazily fills in subsystem etc. from
    /// `/sys`) and the monitor (which fills everything from the wire
    /// payload and seals the result).
    fn new_unsealed(sys_root: &str, syspath: String) -> Result<Self, RecordError> {
        let devpath = derive_devpath(sys_root, &syspath)?;
        let (sysname, sysnum) = derive_sysname_and_num(&devpath);

        if sysname.is_empty() || sysname == sys_root {
            return Err(RecordError::EmptySysName);
        }

        Ok(Self(Rc::new(Inner {
            syspath,
            devpath,
            sysname,
            sysnum,
            subsystem: None,
            devtype: None,
            driver: None,
            devnode: None,
            devnum: None,
            ifindex: None,
            properties: PropertyMap::new(),
            tags: HashSet::new(),
            devlinks: HashSet::new(),
            devlink_priority: 0,
            watch_handle: None,
            first_seen_usec: now_usec(),
            uevent_file_consumed: RefCell::new(false),
            db_consumed: RefCell::new(false),
            sealed: false,
            action: None,
            seqnum: None,
            old_devpath: None,
            sys_root: sys_root.to_string(),
            parent: RefCell::new(None),
        })))
    }

    /// Construct a record for the enumerator: the syspath is known,
    /// everything else may be filled in lazily by the caller via
    /// [`DeviceRecordBuilder`].
    pub fn from_syspath(sys_root: &str, syspath: impl Into<String>) -> Result<Self, RecordError> {
        Self::new_unsealed(sys_root, syspath.into())
    }

    pub fn syspath(&self) -> &str {
        &self.0.syspath
    }

    pub fn devpath(&self) -> &str {
        &self.0.devpath
    }

    pub fn sysname(&self) -> &str {
        &self.0.sysname
    }

    pub fn sysnum(&self) -> Option<&str> {
        self.0.sysnum.as_deref()
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.0.subsystem.as_deref()
    }

    pub fn devtype(&self) -> Option<&str> {
        self.0.devtype.as_deref()
    }

    pub fn driver(&self) -> Option<&str> {
        self.0.driver.as_deref()
    }

    pub fn devnode(&self) -> Option<&str> {
        self.0.devnode.as_deref()
    }

    pub fn devnum(&self) -> Option<Devnum> {
        self.0.devnum
    }

    pub fn ifindex(&self) -> Option<i32> {
        self.0.ifindex
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.0.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.0.properties.get(key)
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.0.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.0.tags.contains(tag)
    }

    pub fn devlinks(&self) -> &HashSet<String> {
        &self.0.devlinks
    }

    pub fn devlink_priority(&self) -> i32 {
        self.0.devlink_priority
    }

    pub fn watch_handle(&self) -> Option<i32> {
        self.0.watch_handle
    }

    pub fn first_seen_usec(&self) -> u64 {
        self.0.first_seen_usec
    }

    pub fn is_sealed(&self) -> bool {
        self.0.sealed
    }

    pub fn action(&self) -> Option<Action> {
        self.0.action
    }

    pub fn seqnum(&self) -> Option<u64> {
        self.0.seqnum
    }

    pub fn old_devpath(&self) -> Option<&str> {
        self.0.old_devpath.as_deref()
    }

    pub fn uevent_file_consumed(&self) -> bool {
        *self.0.uevent_file_consumed.borrow()
    }

    pub fn mark_uevent_file_consumed(&self) {
        *self.0.uevent_file_consumed.borrow_mut() = true;
    }

    pub fn db_consumed(&self) -> bool {
        *self.0.db_consumed.borrow()
    }

    pub fn mark_db_consumed(&self) {
        *self.0.db_consumed.borrow_mut() = true;
    }

    /// Device-id string (§6, §8 property 11): `b<major>:<minor>` /
    /// `c<major>:<minor>` for block/char devices with a devnum,
    /// `n<ifindex>` for net devices, else `+<subsystem>:<sysname>`.
    pub fn device_id(&self) -> String {
        device_id_for(self.subsystem(), self.devnum(), self.ifindex(), self.sysname())
    }

    /// The parent device, computed on demand by truncating the
    /// devpath at the last path component and looking up the
    /// resulting syspath. Memoized after the first successful
    /// lookup; a failed lookup (no such parent, e.g. at `/sys`
    /// itself) is not memoized so a later retry after the parent
    /// directory appears can still succeed.
    pub fn parent(&self) -> Option<DeviceRecord> {
        if let Some(cached) = self.0.parent.borrow().as_ref() {
            return cached.clone();
        }

        let parent_devpath = {
            let trimmed = self.devpath().trim_end_matches('/');
            match trimmed.rfind('/') {
                Some(0) | None => return None,
                Some(idx) => &trimmed[..idx],
            }
        };

        let parent_syspath = format!("{}{}", self.0.sys_root, parent_devpath);
        let parent = DeviceRecord::from_syspath(&self.0.sys_root, parent_syspath).ok();

        if parent.is_some() {
            *self.0.parent.borrow_mut() = Some(parent.clone());
        }

        parent
    }

    /// Builds a fully populated, sealed record directly (used by the
    /// monitor once it has decoded a uevent payload). Enforces the
    /// "sealed records have devpath/subsystem/action present"
    /// invariant.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn seal(
        sys_root: &str,
        syspath: String,
        subsystem: Option<String>,
        devtype: Option<String>,
        driver: Option<String>,
        devnode: Option<String>,
        devnum: Option<Devnum>,
        ifindex: Option<i32>,
        properties: PropertyMap,
        action: Action,
        seqnum: u64,
        old_devpath: Option<String>,
    ) -> Result<Self, RecordError> {
        let devpath = derive_devpath(sys_root, &syspath)?;
        let (sysname, sysnum) = derive_sysname_and_num(&devpath);

        if sysname.is_empty() || sysname == sys_root {
            return Err(RecordError::EmptySysName);
        }

        let subsystem = subsystem.ok_or(RecordError::MissingSealedField("subsystem"))?;

        if devnum.is_some() && subsystem.is_empty() {
            return Err(RecordError::DevnumWithoutSubsystem);
        }

        Ok(Self(Rc::new(Inner {
            syspath,
            devpath,
            sysname,
            sysnum,
            subsystem: Some(subsystem),
            devtype,
            driver,
            devnode,
            devnum,
            ifindex,
            properties,
            tags: HashSet::new(),
            devlinks: HashSet::new(),
            devlink_priority: 0,
            watch_handle: None,
            first_seen_usec: now_usec(),
            uevent_file_consumed: RefCell::new(true),
            db_consumed: RefCell::new(true),
            sealed: true,
            action: Some(action),
            seqnum: Some(seqnum),
            old_devpath,
            sys_root: sys_root.to_string(),
            parent: RefCell::new(None),
        })))
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("syspath", &self.syspath())
            .field("devpath", &self.devpath())
            .field("sysname", &self.sysname())
            .field("subsystem", &self.subsystem())
            .field("sealed", &self.is_sealed())
            .field("action", &self.action())
            .finish()
    }
}

/// The `<id>` under which a device's persistent database entry is
/// stored (§6, §8 property 11): `b<major>:<minor>` / `c<major>:<minor>`
/// for block/char devices with a devnum, `n<ifindex>` for net devices,
/// else `+<subsystem>:<sysname>`.
pub fn device_id_for(subsystem: Option<&str>, devnum: Option<Devnum>, ifindex: Option<i32>, sysname: &str) -> String {
    if let Some(devnum) = devnum {
        let letter = if subsystem == Some("block") { 'b' } else { 'c' };
        return format!("{letter}{}:{}", devnum.major, devnum.minor);
    }

    if let Some(ifindex) = ifindex {
        return format!("n{ifindex}");
    }

    format!("+{}:{}", subsystem.unwrap_or(""), sysname)
}

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Mutable builder used by the enumerator while it fills in a record
/// from `/sys` reads, before handing out the sealed-immutable
/// [`DeviceRecord`] handle. The enumerator never mutates a
/// [`DeviceRecord`] after construction; it only ever builds a fresh
/// one.
pub struct DeviceRecordBuilder {
    sys_root: String,
    syspath: String,
    subsystem: Option<String>,
    devtype: Option<String>,
    driver: Option<String>,
    devnode: Option<String>,
    devnum: Option<Devnum>,
    ifindex: Option<i32>,
    properties: PropertyMap,
    tags: HashSet<String>,
    devlinks: HashSet<String>,
    devlink_priority: i32,
    watch_handle: Option<i32>,
    first_seen_usec: Option<u64>,
    db_consumed: bool,
}

impl DeviceRecordBuilder {
    pub fn new(sys_root: impl Into<String>, syspath: impl Into<String>) -> Self {
        Self {
            sys_root: sys_root.into(),
            syspath: syspath.into(),
            subsystem: None,
            devtype: None,
            driver: None,
            devnode: None,
            devnum: None,
            ifindex: None,
            properties: PropertyMap::new(),
            tags: HashSet::new(),
            devlinks: HashSet::new(),
            devlink_priority: 0,
            watch_handle: None,
            first_seen_usec: None,
            db_consumed: false,
        }
    }

    pub fn subsystem(mut self, v: impl Into<String>) -> Self {
        self.subsystem = Some(v.into());
        self
    }

    pub fn devtype(mut self, v: impl Into<String>) -> Self {
        self.devtype = Some(v.into());
        self
    }

    pub fn driver(mut self, v: impl Into<String>) -> Self {
        self.driver = Some(v.into());
        self
    }

    pub fn devnode(mut self, v: impl Into<String>) -> Self {
        self.devnode = Some(v.into());
        self
    }

    pub fn devnum(mut self, major: u32, minor: u32) -> Self {
        self.devnum = Some(Devnum { major, minor });
        self
    }

    pub fn ifindex(mut self, v: i32) -> Self {
        self.ifindex = Some(v);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn devlink(mut self, devlink: impl Into<String>) -> Self {
        self.devlinks.insert(devlink.into());
        self
    }

    pub fn devlink_priority(mut self, v: i32) -> Self {
        self.devlink_priority = v;
        self
    }

    pub fn watch_handle(mut self, v: i32) -> Self {
        self.watch_handle = Some(v);
        self
    }

    pub fn first_seen_usec(mut self, v: u64) -> Self {
        self.first_seen_usec = Some(v);
        self
    }

    /// Merges in everything the persistent per-device database (§6)
    /// carries and marks the record as "initialized".
    pub fn db_entry(mut self, entry: crate::db::DbEntry) -> Self {
        self.tags.extend(entry.tags);
        self.devlinks.extend(entry.devlinks);
        self.devlink_priority = entry.devlink_priority;
        self.watch_handle = entry.watch_handle;
        if let Some(usec) = entry.first_seen_usec {
            self.first_seen_usec = Some(usec);
        }
        for (key, value) in entry.properties {
            self.properties.insert(key, value);
        }
        self.db_consumed = true;
        self
    }

    /// Build the unsealed record (enumerator output is never sealed —
    /// §3 reserves sealing for monitor-delivered events).
    pub fn build(self) -> Result<DeviceRecord, RecordError> {
        let devpath = derive_devpath(&self.sys_root, &self.syspath)?;
        let (sysname, sysnum) = derive_sysname_and_num(&devpath);

        if sysname.is_empty() || sysname == self.sys_root {
            return Err(RecordError::EmptySysName);
        }

        if self.devnum.is_some() && self.subsystem.is_none() {
            return Err(RecordError::DevnumWithoutSubsystem);
        }

        Ok(DeviceRecord(Rc::new(Inner {
            syspath: self.syspath,
            devpath,
            sysname,
            sysnum,
            subsystem: self.subsystem,
            devtype: self.devtype,
            driver: self.driver,
            devnode: self.devnode,
            devnum: self.devnum,
            ifindex: self.ifindex,
            properties: self.properties,
            tags: self.tags,
            devlinks: self.devlinks,
            devlink_priority: self.devlink_priority,
            watch_handle: self.watch_handle,
            first_seen_usec: self.first_seen_usec.unwrap_or_else(now_usec),
            uevent_file_consumed: RefCell::new(false),
            db_consumed: RefCell::new(self.db_consumed),
            sealed: false,
            action: None,
            seqnum: None,
            old_devpath: None,
            sys_root: self.sys_root,
            parent: RefCell::new(None),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devpath_always_starts_with_slash() {
        let rec = DeviceRecord::from_syspath("/sys", "/sys/devices/virtual/net/eth0").unwrap();
        assert!(rec.devpath().starts_with('/'));
        assert_eq!(rec.devpath(), "/devices/virtual/net/eth0");
    }

    #[test]
    fn sysname_rewrites_bang_to_slash() {
        let rec = DeviceRecord::from_syspath("/sys", "/sys/class/bsg/bsg!0:0:0:0").unwrap();
        assert_eq!(rec.sysname(), "bsg/0:0:0:0");
    }

    #[test]
    fn sysnum_is_trailing_digits() {
        let rec = DeviceRecord::from_syspath("/sys", "/sys/class/net/eth10").unwrap();
        assert_eq!(rec.sysname(), "eth10");
        assert_eq!(rec.sysnum(), Some("10"));

        let rec = DeviceRecord::from_syspath("/sys", "/sys/class/tty/console").unwrap();
        assert_eq!(rec.sysnum(), None);
    }

    #[test]
    fn rejects_syspath_outside_sys_root() {
        let err = DeviceRecord::from_syspath("/sys", "/proc/self").unwrap_err();
        assert!(matches!(err, RecordError::NotUnderSysRoot(_)));
    }

    #[test]
    fn device_id_block_device() {
        let rec = DeviceRecordBuilder::new("/sys", "/sys/class/block/sda1")
            .subsystem("block")
            .devnum(259, 131072)
            .build()
            .unwrap();
        assert_eq!(rec.device_id(), "b259:131072");
    }

    #[test]
    fn device_id_net_device() {
        let rec = DeviceRecordBuilder::new("/sys", "/sys/class/net/eth0")
            .subsystem("net")
            .ifindex(3)
            .build()
            .unwrap();
        assert_eq!(rec.device_id(), "n3");
    }

    #[test]
    fn device_id_fallback_subsystem_sysname() {
        let rec = DeviceRecordBuilder::new("/sys", "/sys/devices/pci0000:00/0000:00:1f.2")
            .subsystem("pci")
            .build()
            .unwrap();
        assert_eq!(rec.device_id(), "+pci:0000:00:1f.2");
    }

    #[test]
    fn parent_is_computed_on_demand_and_memoized() {
        let child = DeviceRecord::from_syspath(
            "/sys",
            "/sys/devices/pci0000:00/0000:00:1f.2/usb1",
        )
        .unwrap();

        let parent1 = child.parent().unwrap();
        assert_eq!(parent1.devpath(), "/devices/pci0000:00/0000:00:1f.2");

        let parent2 = child.parent().unwrap();
        assert_eq!(parent1.devpath(), parent2.devpath());
    }

    #[test]
    fn sealed_record_requires_subsystem() {
        let err = DeviceRecord::seal(
            "/sys",
            "/sys/devices/virtual/net/eth0".into(),
            None,
            None,
            None,
            None,
            None,
            None,
            PropertyMap::new(),
            Action::Add,
            1,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::MissingSealedField("subsystem")));
    }

    #[test]
    fn property_iteration_order_is_stable() {
        let mut props = PropertyMap::new();
        props.insert("A", "1");
        props.insert("B", "2");
        props.insert("A", "3");

        let collected: Vec<_> = props.iter().collect();
        assert_eq!(collected, vec![("A", "3"), ("B", "2")]);
    }
}
