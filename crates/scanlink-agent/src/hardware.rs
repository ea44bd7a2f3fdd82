//! # Hardware Fingerprint Reader
//!
//! Reads the stable attributes the device id is derived from. Paths are
//! configurable so tests can point at a fake root.

use std::path::{Path, PathBuf};
use tracing::debug;

use scanlink_core::HardwareFingerprint;

/// Where the fingerprint attributes come from.
#[derive(Debug, Clone)]
pub struct HardwareSources {
    pub cpuinfo: PathBuf,
    pub net_class: PathBuf,
    pub machine_id: PathBuf,
}

impl Default for HardwareSources {
    fn default() -> Self {
        HardwareSources {
            cpuinfo: PathBuf::from("/proc/cpuinfo"),
            net_class: PathBuf::from("/sys/class/net"),
            machine_id: PathBuf::from("/etc/machine-id"),
        }
    }
}

impl HardwareSources {
    /// Sources rooted at `root` instead of `/`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        HardwareSources {
            cpuinfo: root.join("proc/cpuinfo"),
            net_class: root.join("sys/class/net"),
            machine_id: root.join("etc/machine-id"),
        }
    }

    /// Reads whatever attributes are present. Missing files are not errors.
    pub async fn read(&self) -> HardwareFingerprint {
        let fingerprint = HardwareFingerprint {
            cpu_serial: self.read_cpu_serial().await,
            mac_address: self.read_mac().await,
            machine_id: read_trimmed(&self.machine_id).await,
        };

        debug!(
            cpu_serial = fingerprint.cpu_serial.is_some(),
            mac = fingerprint.mac_address.is_some(),
            machine_id = fingerprint.machine_id.is_some(),
            "Read hardware fingerprint"
        );
        fingerprint
    }

    async fn read_cpu_serial(&self) -> Option<String> {
        let cpuinfo = tokio::fs::read_to_string(&self.cpuinfo).await.ok()?;
        cpuinfo.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "Serial")
                .then(|| value.trim().to_string())
                .filter(|v| !v.is_empty() && !v.chars().all(|c| c == '0'))
        })
    }

    /// First non-loopback interface, in name order, with a non-zero MAC.
    async fn read_mac(&self) -> Option<String> {
        let mut entries = tokio::fs::read_dir(&self.net_class).await.ok()?;
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name != "lo" {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        for name in names {
            let Some(mac) = read_trimmed(&self.net_class.join(&name).join("address")).await else {
                continue;
            };
            if mac.chars().any(|c| c.is_ascii_hexdigit() && c != '0') {
                return Some(mac);
            }
        }
        None
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanlink_core::derive_device_id;
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_reads_all_attributes() {
        let root = tempfile::tempdir().unwrap();
        write(
            root.path(),
            "proc/cpuinfo",
            "processor\t: 0\nHardware\t: BCM2835\nSerial\t\t: 10000000a3f5c2d1\n",
        );
        write(root.path(), "sys/class/net/lo/address", "00:00:00:00:00:00\n");
        write(root.path(), "sys/class/net/wlan0/address", "b8:27:eb:11:22:33\n");
        write(root.path(), "sys/class/net/eth0/address", "B8:27:EB:AA:BB:CC\n");
        write(root.path(), "etc/machine-id", "0123456789abcdef0123456789abcdef\n");

        let fp = HardwareSources::rooted_at(root.path()).read().await;
        assert_eq!(fp.cpu_serial.as_deref(), Some("10000000a3f5c2d1"));
        assert_eq!(fp.mac_address.as_deref(), Some("B8:27:EB:AA:BB:CC"));
        assert_eq!(
            fp.machine_id.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_zero_serial_falls_back_to_mac() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "proc/cpuinfo", "Serial\t\t: 0000000000000000\n");
        write(root.path(), "sys/class/net/eth0/address", "b8:27:eb:aa:bb:cc\n");

        let fp = HardwareSources::rooted_at(root.path()).read().await;
        assert!(fp.cpu_serial.is_none());
        assert!(derive_device_id(&fp).is_ok());
    }

    #[tokio::test]
    async fn test_same_host_same_id() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "etc/machine-id", "feedfacefeedfacefeedfacefeedface");

        let sources = HardwareSources::rooted_at(root.path());
        let first = derive_device_id(&sources.read().await).unwrap();
        let second = derive_device_id(&sources.read().await).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_root_has_no_identity() {
        let root = tempfile::tempdir().unwrap();
        let fp = HardwareSources::rooted_at(root.path()).read().await;
        assert!(fp.is_empty());
        assert!(derive_device_id(&fp).is_err());
    }
}
