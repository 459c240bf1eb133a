//! Device capability queries and the connectivity monitor.

use crate::bus::{Bus, DEVICE_STATE};
use crate::signal::Signal;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uplink_core::{UplinkError, UplinkResult};

pub const DEVICE_STATE_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    None,
    Wifi,
    Cell,
    Ethernet,
}

/// Connectivity health published by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub network_type: NetworkType,
    pub metered: bool,
}

/// Camera stills, JPEG encoded.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub back: Option<Vec<u8>>,
    pub front: Option<Vec<u8>>,
}

/// Hardware queries the daemon needs. Calls may touch the filesystem and
/// should run off the async executor.
pub trait Device: Send + Sync {
    fn serial(&self) -> String;
    fn sim_info(&self) -> Value;
    fn network_type(&self) -> NetworkType;
    fn network_metered(&self) -> bool;
    fn networks(&self) -> Value;
    fn snapshot(&self) -> UplinkResult<Snapshot>;

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            network_type: self.network_type(),
            metered: self.network_metered(),
        }
    }
}

/// Linux host implementation backed by sysfs.
pub struct HostDevice {
    net_root: PathBuf,
    snapshot_dir: Option<PathBuf>,
}

impl HostDevice {
    pub fn new(snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            net_root: PathBuf::from("/sys/class/net"),
            snapshot_dir,
        }
    }

    /// Interfaces that are up, with their classified type.
    fn up_interfaces(&self) -> Vec<(String, NetworkType)> {
        let Ok(entries) = std::fs::read_dir(&self.net_root) else {
            return Vec::new();
        };
        let mut out: Vec<_> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let kind = classify_interface(&name)?;
                let state = std::fs::read_to_string(entry.path().join("operstate")).ok()?;
                (state.trim() == "up").then_some((name, kind))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn classify_interface(name: &str) -> Option<NetworkType> {
    if name.starts_with("wwan") || name.starts_with("rmnet") || name.starts_with("ppp") {
        Some(NetworkType::Cell)
    } else if name.starts_with("wlan") || name.starts_with("wl") {
        Some(NetworkType::Wifi)
    } else if name.starts_with("eth") || name.starts_with("en") {
        Some(NetworkType::Ethernet)
    } else {
        None
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let s = std::fs::read_to_string(path).ok()?;
    let s = s.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!s.is_empty()).then(|| s.to_string())
}

impl Device for HostDevice {
    fn serial(&self) -> String {
        read_trimmed(Path::new("/proc/device-tree/serial-number"))
            .or_else(|| read_trimmed(Path::new("/etc/machine-id")))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn sim_info(&self) -> Value {
        let has_modem = self
            .up_interfaces()
            .iter()
            .any(|(_, kind)| *kind == NetworkType::Cell);
        json!({
            "sim_id": "",
            "mcc_mnc": Value::Null,
            "network_type": self.network_type(),
            "sim_state": if has_modem { vec!["READY"] } else { vec!["ABSENT"] },
            "data_connected": has_modem,
        })
    }

    fn network_type(&self) -> NetworkType {
        let kinds: Vec<_> = self.up_interfaces().into_iter().map(|(_, k)| k).collect();
        [NetworkType::Ethernet, NetworkType::Wifi, NetworkType::Cell]
            .into_iter()
            .find(|k| kinds.contains(k))
            .unwrap_or(NetworkType::None)
    }

    fn network_metered(&self) -> bool {
        self.network_type() == NetworkType::Cell
    }

    fn networks(&self) -> Value {
        Value::Array(
            self.up_interfaces()
                .into_iter()
                .map(|(name, kind)| json!({"interface": name, "type": kind}))
                .collect(),
        )
    }

    fn snapshot(&self) -> UplinkResult<Snapshot> {
        let dir = self
            .snapshot_dir
            .as_ref()
            .ok_or_else(|| UplinkError::Other("snapshot not available".into()))?;
        let snap = Snapshot {
            back: std::fs::read(dir.join("back.jpg")).ok(),
            front: std::fs::read(dir.join("front.jpg")).ok(),
        };
        if snap.back.is_none() && snap.front.is_none() {
            return Err(UplinkError::Other("snapshot not available".into()));
        }
        Ok(snap)
    }
}

/// Probe device connectivity every `interval`, publishing on the watch
/// channel and the bus until `exit` is set.
pub async fn run_monitor(
    device: Arc<dyn Device>,
    status_tx: Arc<watch::Sender<DeviceStatus>>,
    bus: Arc<Bus>,
    interval: Duration,
    exit: Signal,
) {
    loop {
        let dev = device.clone();
        match tokio::task::spawn_blocking(move || dev.status()).await {
            Ok(status) => {
                status_tx.send_if_modified(|current| {
                    if *current != status {
                        debug!(?status, "device status changed");
                        *current = status;
                        true
                    } else {
                        false
                    }
                });
                match serde_json::to_value(status) {
                    Ok(v) => bus.publish(DEVICE_STATE, v),
                    Err(e) => warn!(error = %e, "device status encode failed"),
                }
            }
            Err(e) => warn!(error = %e, "device status read failed"),
        }
        if exit.sleep(interval).await {
            break;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDevice;
    use super::*;
    use std::sync::atomic::Ordering;

    fn fake_sysfs(ifaces: &[(&str, &str)]) -> (tempfile::TempDir, HostDevice) {
        let dir = tempfile::tempdir().unwrap();
        for (name, state) in ifaces {
            let p = dir.path().join(name);
            std::fs::create_dir_all(&p).unwrap();
            std::fs::write(p.join("operstate"), format!("{state}\n")).unwrap();
        }
        let dev = HostDevice {
            net_root: dir.path().to_path_buf(),
            snapshot_dir: None,
        };
        (dir, dev)
    }

    #[test]
    fn classifies_interfaces() {
        let (_d, dev) = fake_sysfs(&[("lo", "unknown"), ("wwan0", "up"), ("wlan0", "down")]);
        assert_eq!(dev.network_type(), NetworkType::Cell);
        assert!(dev.network_metered());

        let (_d, dev) = fake_sysfs(&[("wwan0", "up"), ("wlan0", "up")]);
        assert_eq!(dev.network_type(), NetworkType::Wifi);
        assert!(!dev.network_metered());
        assert_eq!(dev.networks().as_array().unwrap().len(), 2);

        let (_d, dev) = fake_sysfs(&[]);
        assert_eq!(dev.network_type(), NetworkType::None);
    }

    #[test]
    fn networks_are_listed_by_interface_name() {
        let (_d, dev) = fake_sysfs(&[("wwan0", "up"), ("eth0", "up"), ("wlan0", "up")]);
        let names: Vec<_> = dev
            .networks()
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["interface"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["eth0", "wlan0", "wwan0"]);
        assert_eq!(dev.networks()[0]["type"], json!("ethernet"));
        assert_eq!(dev.network_type(), NetworkType::Ethernet);
    }

    #[test]
    fn snapshot_requires_source() {
        let (_d, dev) = fake_sysfs(&[]);
        assert!(dev.snapshot().is_err());

        let snaps = tempfile::tempdir().unwrap();
        std::fs::write(snaps.path().join("front.jpg"), b"\xff\xd8").unwrap();
        let dev = HostDevice::new(Some(snaps.path().to_path_buf()));
        let snap = dev.snapshot().unwrap();
        assert!(snap.back.is_none());
        assert_eq!(snap.front.unwrap(), b"\xff\xd8");
    }

    #[test]
    fn status_serializes_camel_case() {
        let v = serde_json::to_value(DeviceStatus {
            network_type: NetworkType::Cell,
            metered: true,
        })
        .unwrap();
        assert_eq!(v, json!({"networkType": "cell", "metered": true}));
    }

    #[tokio::test]
    async fn monitor_publishes_changes() {
        let device = Arc::new(FakeDevice::default());
        let (tx, mut rx) = watch::channel(DeviceStatus::default());
        let bus = Arc::new(Bus::new());
        let exit = Signal::new();
        let task = tokio::spawn(run_monitor(
            device.clone(),
            Arc::new(tx),
            bus.clone(),
            Duration::from_millis(10),
            exit.clone(),
        ));

        rx.wait_for(|s| s.network_type == NetworkType::Wifi).await.unwrap();
        device.metered.store(true, Ordering::SeqCst);
        rx.wait_for(|s| s.metered).await.unwrap();

        let published = bus
            .next_message(DEVICE_STATE, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(published["metered"], json!(true));

        exit.set();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
