use super::{FetchError, SnapshotSource};
use crate::snapshot::{FilesystemEntry, Snapshot};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{DiskExt, System, SystemExt};

pub struct LocalSource {
    system: Arc<Mutex<System>>,
    timeout: Duration,
}

impl LocalSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            timeout,
        }
    }
}

#[async_trait]
impl SnapshotSource for LocalSource {
    async fn fetch_snapshot(&self) -> Result<Snapshot, FetchError> {
        let system = Arc::clone(&self.system);
        let collect = tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(|p| p.into_inner());
            collect_local(&mut system, crate::now_unix())
        });
        match tokio::time::timeout(self.timeout, collect).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(join)) => Err(FetchError::Local(join.to_string())),
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

fn collect_local(system: &mut System, now_unix: i64) -> Snapshot {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();

    // sysinfo 0.29 отдаёт память в байтах.
    let mem_total = system.total_memory();
    let mem_available = system.available_memory();

    let mut seen = HashSet::new();
    let filesystems = system
        .disks()
        .iter()
        .map(|d| FilesystemEntry {
            size_bytes: Some(d.total_space()),
            avail_bytes: Some(d.available_space()),
            ..FilesystemEntry::new(
                &d.name().to_string_lossy(),
                &d.mount_point().to_string_lossy(),
                &String::from_utf8_lossy(d.file_system()),
            )
        })
        .filter(|fs| {
            let (device, mount, fstype) = fs.identity();
            seen.insert((device.to_string(), mount.to_string(), fstype.to_string()))
        })
        .collect();

    Snapshot {
        timestamp_unix: now_unix,
        load5: Some(system.load_average().five),
        cpu_cores: system.cpus().len() as u32,
        mem_total_bytes: (mem_total > 0).then_some(mem_total),
        mem_available_bytes: (mem_total > 0).then_some(mem_available),
        filesystems,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_snapshot_has_no_inode_data() {
        let source = LocalSource::new(Duration::from_secs(30));
        let snapshot = source.fetch_snapshot().await.expect("локальный замер");
        assert!(snapshot
            .filesystems
            .iter()
            .all(|fs| fs.inode_total.is_none() && fs.inode_free.is_none()));
        assert!(snapshot.timestamp_unix > 0);
    }
}
