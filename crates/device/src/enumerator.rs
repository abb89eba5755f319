//! One-shot `/sys` tree walk producing a priority-ordered device list
//! (§4.6).
//!
//! Firmware probing races mean siblings under the same parent are not
//! safe to add in plain devpath order: a sound card's control device
//! must be registered after every other device it fronts for, and
//! software RAID/device-mapper nodes must come after the "real" block
//! devices they may stack on. The comparator below encodes exactly
//! those two deferrals; everything else falls back to lexicographic
//! devpath order, which is already a valid topological order for the
//! rest of the tree (parents are shorter paths than their children).

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::db::{self, DEFAULT_DB_ROOT};
use crate::record::{device_id_for, DeviceRecord, DeviceRecordBuilder, RecordError};

#[derive(Debug, Error)]
pub enum EnumeratorError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

/// Sort key controlling enumeration order. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Priority {
    Normal,
    SoundControl,
    StackedBlock,
}

fn priority_of(devpath: &str) -> Priority {
    let sysname = devpath.rsplit('/').next().unwrap_or("");

    if sysname.starts_with("controlC") {
        return Priority::SoundControl;
    }
    if devpath.contains("/block/md") || sysname.starts_with("dm-") {
        return Priority::StackedBlock;
    }

    Priority::Normal
}

fn compare_devpaths(a: &str, b: &str) -> Ordering {
    priority_of(a).cmp(&priority_of(b)).then_with(|| a.cmp(b))
}

/// Walks `sys_root` and returns every discoverable device record in
/// enumeration order. A subsystem directory missing `uevent` (no
/// device registered there, just a directory) is silently skipped
/// rather than treated as an error, matching the tolerant-of-holes
/// nature of a live `/sys` tree.
pub fn enumerate(sys_root: &str) -> Result<Vec<DeviceRecord>, EnumeratorError> {
    enumerate_with_db_root(sys_root, DEFAULT_DB_ROOT)
}

/// As [`enumerate`], but reads the persistent device database (§6)
/// from `db_root` instead of the default `/run/udev/data` — mainly so
/// tests can point it at a fixture directory.
pub fn enumerate_with_db_root(sys_root: &str, db_root: &str) -> Result<Vec<DeviceRecord>, EnumeratorError> {
    let mut syspaths = Vec::new();
    collect_syspaths(Path::new(sys_root), sys_root, &mut syspaths)?;

    syspaths.sort_by(|a, b| compare_devpaths(a, b));

    let mut records = Vec::with_capacity(syspaths.len());
    for syspath in syspaths {
        match build_record(sys_root, db_root, &syspath) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::debug!(syspath, error = %err, "skipping device during enumeration");
            }
        }
    }

    Ok(records)
}

fn collect_syspaths(dir: &Path, sys_root: &str, out: &mut Vec<String>) -> Result<(), EnumeratorError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(EnumeratorError::Io {
                path: dir.display().to_string(),
                source,
            })
        }
    };

    let mut has_uevent = false;
    let mut subdirs = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|source| EnumeratorError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name == "uevent" {
            has_uevent = true;
        } else if file_type.is_dir() && !file_type.is_symlink() {
            subdirs.push(entry.path());
        }
    }

    if has_uevent {
        if let Some(syspath) = dir.to_str() {
            out.push(syspath.to_string());
        }
    }

    for subdir in subdirs {
        collect_syspaths(&subdir, sys_root, out)?;
    }

    Ok(())
}

fn build_record(sys_root: &str, db_root: &str, syspath: &str) -> Result<DeviceRecord, EnumeratorError> {
    let uevent_path = format!("{syspath}/uevent");
    let mut builder = DeviceRecordBuilder::new(sys_root, syspath);
    let mut subsystem_from_uevent = false;

    // Tracked alongside the builder (which is consume-and-return) so
    // the device-id can be computed once uevent parsing is done.
    let mut subsystem: Option<String> = None;
    let mut devnum: Option<(u32, u32)> = None;
    let mut ifindex: Option<i32> = None;

    if let Ok(contents) = fs::read_to_string(&uevent_path) {
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            builder = match key {
                "SUBSYSTEM" => {
                    subsystem_from_uevent = true;
                    subsystem = Some(value.to_string());
                    builder.subsystem(value)
                }
                "DEVTYPE" => builder.devtype(value),
                "DRIVER" => builder.driver(value),
                "DEVNAME" => builder.devnode(format!("/dev/{value}")),
                "MAJOR" => {
                    if let (Ok(major), Some(minor)) = (value.parse(), minor_from(&contents)) {
                        devnum = Some((major, minor));
                        builder.devnum(major, minor)
                    } else {
                        builder
                    }
                }
                "IFINDEX" => {
                    if let Ok(parsed) = value.parse() {
                        ifindex = Some(parsed);
                        builder.ifindex(parsed)
                    } else {
                        builder
                    }
                }
                _ => builder.property(key, value),
            };
        }
    }

    // `subsystem` is a symlink to the subsystem's directory even when
    // `uevent` omits the SUBSYSTEM line; fall back to it rather than
    // leaving the record without a subsystem.
    if !subsystem_from_uevent {
        if let Some(link) = read_subsystem_link(syspath) {
            subsystem = Some(link.clone());
            builder = builder.subsystem(link);
        }
    }

    let sysname = syspath.rsplit('/').next().unwrap_or("").replace('!', "/");
    let id = device_id_for(
        subsystem.as_deref(),
        devnum.map(|(major, minor)| crate::record::Devnum { major, minor }),
        ifindex,
        &sysname,
    );

    if let Some(entry) = db::read(db_root, &id) {
        builder = builder.db_entry(entry);
    }

    Ok(builder.build()?)
}

fn minor_from(uevent_contents: &str) -> Option<u32> {
    uevent_contents
        .lines()
        .find_map(|line| line.strip_prefix("MINOR=").and_then(|v| v.parse().ok()))
}

fn read_subsystem_link(syspath: &str) -> Option<String> {
    let link = format!("{syspath}/subsystem");
    let target = fs::read_link(link).ok()?;
    target.file_name()?.to_str().map(str::to_string)
}
