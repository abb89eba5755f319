//! Read-only access to the persistent per-device database at
//! `<db-root>/<id>` (§6), normally rooted at `/run/udev/data`.
//!
//! Lines are `<letter>:<value>\n`; recognised letters are `S`
//! (devlink path under `/dev/`), `L` (devlink priority), `E`
//! (`key=value` property), `G` (tag), `W` (watch handle), `I`
//! (microsecond first-seen timestamp). Unknown letters are logged and
//! ignored. A present file marks the device as "initialized".

use std::collections::HashSet;
use std::fs;

/// Default root of the persistent device database.
pub const DEFAULT_DB_ROOT: &str = "/run/udev/data";

#[derive(Debug, Default, Clone)]
pub struct DbEntry {
    pub devlinks: HashSet<String>,
    pub devlink_priority: i32,
    pub properties: Vec<(String, String)>,
    pub tags: HashSet<String>,
    pub watch_handle: Option<i32>,
    pub first_seen_usec: Option<u64>,
}

/// Reads `<db_root>/<id>`. Returns `None` if no entry exists for this
/// device yet (not an error; most devices never get one).
pub fn read(db_root: &str, id: &str) -> Option<DbEntry> {
    let path = format!("{db_root}/{id}");
    let contents = fs::read_to_string(&path).ok()?;

    let mut entry = DbEntry::default();
    for line in contents.lines() {
        let Some((letter, value)) = line.split_once(':') else {
            continue;
        };
        match letter {
            "S" => {
                entry.devlinks.insert(format!("/dev/{value}"));
            }
            "L" => {
                if let Ok(priority) = value.parse() {
                    entry.devlink_priority = priority;
                }
            }
            "E" => {
                if let Some((key, val)) = value.split_once('=') {
                    entry.properties.push((key.to_string(), val.to_string()));
                }
            }
            "G" => {
                entry.tags.insert(value.to_string());
            }
            "W" => {
                if let Ok(handle) = value.parse() {
                    entry.watch_handle = Some(handle);
                }
            }
            "I" => {
                if let Ok(usec) = value.parse() {
                    entry.first_seen_usec = Some(usec);
                }
            }
            other => tracing::debug!(id, letter = other, "ignoring unrecognised device-database line"),
        }
    }

    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognised_letters_and_ignores_unknown_ones() {
        let tmp = std::env::temp_dir().join(format!("device-db-test-{}", std::process::id()));
        fs::create_dir_all(&tmp).unwrap();
        fs::write(
            tmp.join("n3"),
            "S:disk/by-id/foo\nL:10\nE:ID_NET_NAME=eth0\nG:systemd\nW:7\nI:12345\nZ:bogus\n",
        )
        .unwrap();

        let entry = read(tmp.to_str().unwrap(), "n3").unwrap();
        assert!(entry.devlinks.contains("/dev/disk/by-id/foo"));
        assert_eq!(entry.devlink_priority, 10);
        assert_eq!(entry.properties, vec![("ID_NET_NAME".to_string(), "eth0".to_string())]);
        assert!(entry.tags.contains("systemd"));
        assert_eq!(entry.watch_handle, Some(7));
        assert_eq!(entry.first_seen_usec, Some(12345));

        fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn missing_entry_is_none_not_an_error() {
        assert!(read("/nonexistent-db-root", "n3").is_none());
    }
}
