use crate::config::Thresholds;
use crate::snapshot::{FilesystemEntry, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const EXCLUDED_MOUNT_PREFIXES: [&str; 4] = ["/proc", "/sys", "/dev", "/run"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Cpu,
    Mem,
    Disk,
    Inode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckMeta {
    Cpu {
        load5: f64,
        cores: u32,
    },
    Mem {
        available_bytes: u64,
        total_bytes: u64,
    },
    Disk {
        mount: String,
        fstype: String,
        device: String,
        size_bytes: u64,
        avail_bytes: u64,
    },
    Inode {
        mount: String,
        fstype: String,
        device: String,
        files_total: u64,
        files_free: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub check_id: String,
    pub status: CheckStatus,
    pub value: f64,
    pub message: String,
    pub meta: CheckMeta,
}

impl CheckMeta {
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckMeta::Cpu { .. } => CheckKind::Cpu,
            CheckMeta::Mem { .. } => CheckKind::Mem,
            CheckMeta::Disk { .. } => CheckKind::Disk,
            CheckMeta::Inode { .. } => CheckKind::Inode,
        }
    }
}

impl CheckResult {
    pub fn kind(&self) -> CheckKind {
        self.meta.kind()
    }

    pub fn mount(&self) -> Option<&str> {
        match &self.meta {
            CheckMeta::Disk { mount, .. } | CheckMeta::Inode { mount, .. } => Some(mount),
            _ => None,
        }
    }

    pub fn is_alert(&self) -> bool {
        self.status == CheckStatus::Alert
    }
}

/// Оценивает замер по порогам. Чистая функция: без I/O и глобального
/// состояния. Порядок результатов: cpu, mem, диски в порядке обнаружения,
/// затем inode в том же порядке. Повторный check_id заменяет предыдущий
/// результат, сохраняя его позицию.
pub fn evaluate(snapshot: &Snapshot, thresholds: &Thresholds) -> Vec<CheckResult> {
    let mut out = Results::default();

    if let Some(result) = evaluate_cpu(snapshot, thresholds) {
        out.push(result);
    }
    if let Some(result) = evaluate_mem(snapshot, thresholds) {
        out.push(result);
    }

    let candidates: Vec<&FilesystemEntry> = snapshot
        .filesystems
        .iter()
        .filter(|fs| !is_excluded(fs, thresholds))
        .collect();

    for fs in &candidates {
        if let Some(result) = evaluate_disk(fs, thresholds) {
            out.push(result);
        }
    }
    if thresholds.enable_inodes {
        for fs in &candidates {
            if let Some(result) = evaluate_inode(fs, thresholds) {
                out.push(result);
            }
        }
    }

    out.into_vec()
}

pub fn is_excluded(fs: &FilesystemEntry, thresholds: &Thresholds) -> bool {
    if fs.mount.is_empty() {
        return true;
    }
    if thresholds.exclude_fs_types.iter().any(|t| t == &fs.fstype) {
        return true;
    }
    EXCLUDED_MOUNT_PREFIXES
        .iter()
        .copied()
        .chain(thresholds.exclude_mount_prefixes.iter().map(String::as_str))
        .any(|prefix| mount_under(&fs.mount, prefix))
}

fn mount_under(mount: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    mount == prefix
        || mount
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn evaluate_cpu(snapshot: &Snapshot, t: &Thresholds) -> Option<CheckResult> {
    let per_core = snapshot.cpu_load_per_core()?;
    let load5 = snapshot.load5?;
    let status = status_if(per_core > t.cpu_load_per_core_warn);
    Some(CheckResult {
        check_id: "cpu".to_string(),
        status,
        value: per_core,
        message: format!(
            "CPU load5 на ядро: {} (load5={:.2}, ядер={}, порог {})",
            fmt_pct(per_core),
            load5,
            snapshot.cpu_cores,
            fmt_pct(t.cpu_load_per_core_warn)
        ),
        meta: CheckMeta::Cpu {
            load5,
            cores: snapshot.cpu_cores,
        },
    })
}

fn evaluate_mem(snapshot: &Snapshot, t: &Thresholds) -> Option<CheckResult> {
    let available_fraction = snapshot.mem_available_fraction()?;
    let total_bytes = snapshot.mem_total_bytes?;
    let available_bytes = snapshot.mem_available_bytes?;
    let used_fraction = 1.0 - available_fraction;
    // Свободная доля напрямую, без 1 - x.
    let status = status_if(available_fraction < t.mem_available_pct_warn);
    Some(CheckResult {
        check_id: "mem".to_string(),
        status,
        value: used_fraction,
        message: format!(
            "RAM занято: {} (свободно {} из {}, порог {})",
            fmt_pct(used_fraction),
            fmt_gib(available_bytes),
            fmt_gib(total_bytes),
            fmt_pct(1.0 - t.mem_available_pct_warn)
        ),
        meta: CheckMeta::Mem {
            available_bytes,
            total_bytes,
        },
    })
}

fn evaluate_disk(fs: &FilesystemEntry, t: &Thresholds) -> Option<CheckResult> {
    let used_fraction = fs.used_fraction()?;
    let size_bytes = fs.size_bytes?;
    let avail_bytes = fs.avail_bytes?;
    let status = status_if(used_fraction > t.disk_usage_pct_warn);
    Some(CheckResult {
        check_id: format!("disk:{}", fs.mount),
        status,
        value: used_fraction,
        message: format!(
            "Диск {}: занято {} ({}/{})",
            fs.mount,
            fmt_pct(used_fraction),
            fmt_gib(size_bytes.saturating_sub(avail_bytes)),
            fmt_gib(size_bytes)
        ),
        meta: CheckMeta::Disk {
            mount: fs.mount.clone(),
            fstype: fs.fstype.clone(),
            device: fs.device.clone(),
            size_bytes,
            avail_bytes,
        },
    })
}

fn evaluate_inode(fs: &FilesystemEntry, t: &Thresholds) -> Option<CheckResult> {
    let free_fraction = fs.inode_free_fraction()?;
    let files_total = fs.inode_total?;
    let files_free = fs.inode_free?;
    let status = status_if(free_fraction < t.inode_free_pct_warn);
    Some(CheckResult {
        check_id: format!("inode:{}", fs.mount),
        status,
        value: free_fraction,
        message: format!(
            "Inode {}: свободно {} ({}/{})",
            fs.mount,
            fmt_pct(free_fraction),
            files_free,
            files_total
        ),
        meta: CheckMeta::Inode {
            mount: fs.mount.clone(),
            fstype: fs.fstype.clone(),
            device: fs.device.clone(),
            files_total,
            files_free,
        },
    })
}

fn status_if(alert: bool) -> CheckStatus {
    if alert {
        CheckStatus::Alert
    } else {
        CheckStatus::Ok
    }
}

#[derive(Default)]
struct Results {
    items: Vec<CheckResult>,
    index: HashMap<String, usize>,
}

impl Results {
    fn push(&mut self, result: CheckResult) {
        match self.index.get(&result.check_id) {
            Some(&pos) => self.items[pos] = result,
            None => {
                self.index.insert(result.check_id.clone(), self.items.len());
                self.items.push(result);
            }
        }
    }

    fn into_vec(self) -> Vec<CheckResult> {
        self.items
    }
}

pub fn fmt_pct(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

fn fmt_gib(bytes: u64) -> String {
    format!("{:.2} ГиБ", bytes as f64 / 1024.0 / 1024.0 / 1024.0)
}
