use super::{FetchError, SnapshotSource};
use crate::snapshot::{FilesystemEntry, Snapshot};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

pub struct NodeExporterSource {
    client: Client,
    url: String,
    timeout: Duration,
}

impl NodeExporterSource {
    pub fn new(client: Client, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl SnapshotSource for NodeExporterSource {
    async fn fetch_snapshot(&self) -> Result<Snapshot, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        let snapshot = parse_node_exporter(&body, crate::now_unix());
        debug!(
            url = %self.url,
            filesystems = snapshot.filesystems.len(),
            cores = snapshot.cpu_cores,
            "замер node_exporter получен"
        );
        Ok(snapshot)
    }

    fn name(&self) -> &'static str {
        "node_exporter"
    }
}

#[derive(Debug, PartialEq)]
struct Sample<'a> {
    name: &'a str,
    labels: Vec<(&'a str, String)>,
    value: f64,
}

impl Sample<'_> {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub fn parse_node_exporter(text: &str, timestamp_unix: i64) -> Snapshot {
    let mut snapshot = Snapshot {
        timestamp_unix,
        ..Snapshot::default()
    };
    let mut cpus: BTreeSet<String> = BTreeSet::new();
    let mut fs_index: HashMap<(String, String, String), usize> = HashMap::new();

    for sample in text.lines().filter_map(parse_line) {
        match sample.name {
            "node_load5" => snapshot.load5 = Some(sample.value),
            "node_cpu_seconds_total" => {
                if let Some(cpu) = sample.label("cpu") {
                    cpus.insert(cpu.to_string());
                }
            }
            "node_memory_MemTotal_bytes" => snapshot.mem_total_bytes = Some(to_u64(sample.value)),
            "node_memory_MemAvailable_bytes" => {
                snapshot.mem_available_bytes = Some(to_u64(sample.value))
            }
            "node_filesystem_size_bytes"
            | "node_filesystem_avail_bytes"
            | "node_filesystem_files"
            | "node_filesystem_files_free" => {
                let key = (
                    sample.label("device").unwrap_or_default().to_string(),
                    sample.label("mountpoint").unwrap_or_default().to_string(),
                    sample.label("fstype").unwrap_or_default().to_string(),
                );
                let idx = *fs_index.entry(key).or_insert_with_key(|(device, mount, fstype)| {
                    snapshot
                        .filesystems
                        .push(FilesystemEntry::new(device, mount, fstype));
                    snapshot.filesystems.len() - 1
                });
                let entry = &mut snapshot.filesystems[idx];
                let value = Some(to_u64(sample.value));
                match sample.name {
                    "node_filesystem_size_bytes" => entry.size_bytes = value,
                    "node_filesystem_avail_bytes" => entry.avail_bytes = value,
                    "node_filesystem_files" => entry.inode_total = value,
                    _ => entry.inode_free = value,
                }
            }
            _ => {}
        }
    }

    snapshot.cpu_cores = cpus.len() as u32;
    snapshot
}

fn to_u64(value: f64) -> u64 {
    value.max(0.0) as u64
}

fn parse_line(line: &str) -> Option<Sample<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() {
        return None;
    }

    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if let Some(body) = rest.strip_prefix('{') {
        let (parsed, after) = parse_labels(body)?;
        labels = parsed;
        rest = after;
    }

    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(Sample {
        name,
        labels,
        value,
    })
}

fn parse_labels(input: &str) -> Option<(Vec<(&str, String)>, &str)> {
    let mut labels = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches([' ', ',']);
        if let Some(after) = rest.strip_prefix('}') {
            return Some((labels, after));
        }
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        rest = rest[eq + 1..].trim_start().strip_prefix('"')?;

        let mut value = String::new();
        let mut chars = rest.char_indices();
        let end = loop {
            let (i, c) = chars.next()?;
            match c {
                '"' => break i,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                c => value.push(c),
            }
        };
        labels.push((key, value));
        rest = &rest[end + 1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# HELP node_load5 5m load average.
# TYPE node_load5 gauge
node_load1 0.5
node_load5 2
node_cpu_seconds_total{cpu="0",mode="idle"} 1234.5
node_cpu_seconds_total{cpu="0",mode="user"} 10
node_cpu_seconds_total{cpu="1",mode="idle"} 1200
node_memory_MemTotal_bytes 8e+09
node_memory_MemAvailable_bytes 4e+08
node_filesystem_size_bytes{device="/dev/sda1",fstype="ext4",mountpoint="/"} 1000
node_filesystem_avail_bytes{device="/dev/sda1",fstype="ext4",mountpoint="/"} 100
node_filesystem_files{device="/dev/sda1",fstype="ext4",mountpoint="/"} 500
node_filesystem_files_free{device="/dev/sda1",fstype="ext4",mountpoint="/"} 250
node_filesystem_size_bytes{device="tmpfs",fstype="tmpfs",mountpoint="/run"} 2000 1700000000000
node_filesystem_avail_bytes{device="/dev/sdb1",fstype="xfs",mountpoint="/data"} NaN
"#;

    #[test]
    fn parses_core_fields() {
        let s = parse_node_exporter(SAMPLE, 77);
        assert_eq!(s.timestamp_unix, 77);
        assert_eq!(s.load5, Some(2.0));
        assert_eq!(s.cpu_cores, 2);
        assert_eq!(s.mem_total_bytes, Some(8_000_000_000));
        assert_eq!(s.mem_available_bytes, Some(400_000_000));
    }

    #[test]
    fn repeated_sample_keeps_last_value() {
        let text = "node_load5 1\nnode_load5 3\n\
node_filesystem_avail_bytes{device=\"/dev/sda1\",fstype=\"ext4\",mountpoint=\"/\"} 10\n\
node_filesystem_avail_bytes{device=\"/dev/sda1\",fstype=\"ext4\",mountpoint=\"/\"} 20\n";
        let s = parse_node_exporter(text, 0);
        assert_eq!(s.load5, Some(3.0));
        assert_eq!(s.filesystems.len(), 1);
        assert_eq!(s.filesystems[0].avail_bytes, Some(20));
    }

    #[test]
    fn groups_filesystems_by_identity_in_discovery_order() {
        let s = parse_node_exporter(SAMPLE, 0);
        assert_eq!(s.filesystems.len(), 2);

        let root = &s.filesystems[0];
        assert_eq!(root.identity(), ("/dev/sda1", "/", "ext4"));
        assert_eq!(root.size_bytes, Some(1000));
        assert_eq!(root.avail_bytes, Some(100));
        assert_eq!(root.inode_total, Some(500));
        assert_eq!(root.inode_free, Some(250));

        let run = &s.filesystems[1];
        assert_eq!(run.mount, "/run");
        assert_eq!(run.size_bytes, Some(2000));
        assert_eq!(run.avail_bytes, None);
    }

    #[test]
    fn missing_metrics_stay_unset() {
        let s = parse_node_exporter("node_load5 1.5\n", 0);
        assert_eq!(s.load5, Some(1.5));
        assert_eq!(s.cpu_cores, 0);
        assert_eq!(s.mem_total_bytes, None);
        assert!(s.filesystems.is_empty());
    }

    #[test]
    fn label_values_unescape() {
        let sample = parse_line(r#"m{a="x\"y",b="c\\d",c="e\nf",} 3"#).expect("sample");
        assert_eq!(sample.label("a"), Some("x\"y"));
        assert_eq!(sample.label("b"), Some("c\\d"));
        assert_eq!(sample.label("c"), Some("e\nf"));
        assert_eq!(sample.value, 3.0);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_line("node_load5").is_none());
        assert!(parse_line("node_load5 abc").is_none());
        assert!(parse_line(r#"m{a="unterminated} 1"#).is_none());
        assert!(parse_line("m +Inf").is_none());
    }
}
