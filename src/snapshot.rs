use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub timestamp_unix: i64,
    pub load5: Option<f64>,
    pub cpu_cores: u32,
    pub mem_total_bytes: Option<u64>,
    pub mem_available_bytes: Option<u64>,
    pub filesystems: Vec<FilesystemEntry>,
}

/// Неизвестные размеры остаются `None`, чтобы не давать ложных алертов.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilesystemEntry {
    pub mount: String,
    pub fstype: String,
    pub device: String,
    pub size_bytes: Option<u64>,
    pub avail_bytes: Option<u64>,
    pub inode_total: Option<u64>,
    pub inode_free: Option<u64>,
}

impl Snapshot {
    pub fn cpu_load_per_core(&self) -> Option<f64> {
        if self.cpu_cores == 0 {
            return None;
        }
        self.load5.map(|load| load / self.cpu_cores as f64)
    }

    pub fn mem_available_fraction(&self) -> Option<f64> {
        match (self.mem_total_bytes, self.mem_available_bytes) {
            (Some(total), Some(available)) if total > 0 => Some(available as f64 / total as f64),
            _ => None,
        }
    }
}

impl FilesystemEntry {
    pub fn new(device: &str, mount: &str, fstype: &str) -> Self {
        Self {
            mount: mount.to_string(),
            fstype: fstype.to_string(),
            device: device.to_string(),
            ..Self::default()
        }
    }

    pub fn used_fraction(&self) -> Option<f64> {
        match (self.size_bytes, self.avail_bytes) {
            (Some(size), Some(avail)) if size > 0 => Some(1.0 - avail as f64 / size as f64),
            _ => None,
        }
    }

    pub fn inode_free_fraction(&self) -> Option<f64> {
        match (self.inode_total, self.inode_free) {
            (Some(total), Some(free)) if total > 0 => Some(free as f64 / total as f64),
            _ => None,
        }
    }

    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.device, &self.mount, &self.fstype)
    }
}
