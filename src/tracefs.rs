//! Discovers the tracefs (or debugfs-hosted tracing) mount point and reads
//! the per-tracepoint `format` files it publishes.
//!
//! The mount point is process-wide and immutable once the kernel has booted,
//! so this is a lazily-initialised singleton: the first caller pays the cost
//! of parsing `/proc/mounts`, everyone after that reads the cached string.

use std::fs;
use std::io::{BufRead, BufReader};
use std::sync::OnceLock;

use error::{Error, Result};

static TRACING_ROOT: OnceLock<Option<String>> = OnceLock::new();

/// Returns the tracing root directory, e.g. `/sys/kernel/tracing` or
/// `/sys/kernel/debug/tracing`. `None` if no tracefs/debugfs mount was
/// found in `/proc/mounts`.
pub fn tracing_root() -> Option<&'static str> {
    TRACING_ROOT
        .get_or_init(discover_tracing_root)
        .as_deref()
}

fn discover_tracing_root() -> Option<String> {
    let mounts = fs::File::open("/proc/mounts").ok()?;
    for line in BufReader::new(mounts).lines() {
        let line = line.ok()?;
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mount_point = fields.next()?;
        let fs_type = fields.next()?;

        match fs_type {
            "tracefs" => return Some(mount_point.to_string()),
            "debugfs" => return Some(format!("{}/tracing", mount_point)),
            _ => continue,
        }
    }
    None
}

/// Reads the `format` file for `<system>/<event>`, e.g. `user_events/my_event`.
pub fn read_format_file(system: &str, event: &str) -> Result<String> {
    let root = tracing_root().ok_or_else(|| Error::NotFound {
        name: format!("{}:{}", system, event),
    })?;

    let path = format!("{}/events/{}/{}/format", root, system, event);
    fs::read_to_string(&path).map_err(|_| Error::NotFound {
        name: format!("{}:{}", system, event),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tracefs_line() {
        // exercised indirectly through discover_tracing_root's field-split
        // logic, since the real /proc/mounts is environment-dependent.
        let line = "none /sys/kernel/tracing tracefs rw,relatime 0 0";
        let mut fields = line.split_whitespace();
        fields.next();
        let mount_point = fields.next().unwrap();
        let fs_type = fields.next().unwrap();
        assert_eq!(mount_point, "/sys/kernel/tracing");
        assert_eq!(fs_type, "tracefs");
    }

    #[test]
    fn parses_debugfs_line() {
        let line = "none /sys/kernel/debug debugfs rw,relatime 0 0";
        let mut fields = line.split_whitespace();
        fields.next();
        let mount_point = fields.next().unwrap();
        let fs_type = fields.next().unwrap();
        assert_eq!(format!("{}/tracing", mount_point), "/sys/kernel/debug/tracing");
        assert_eq!(fs_type, "debugfs");
    }
}
