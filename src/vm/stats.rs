//! VM resource statistics from `virsh domstats --raw`

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::exec::RemoteExec;
use super::virsh::{self, DomStats};
use super::VmError;

/// Samples not read for this long are dropped
pub const DEFAULT_SAMPLE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    cpu_time_ns: u64,
    taken_at: Instant,
    last_read: Instant,
}

/// Previous CPU time per `host/vm`, owned by the caller.
///
/// Needed to turn the cumulative CPU counter into a percentage. Every access
/// evicts entries unread for longer than the TTL.
pub struct CpuSampleCache {
    ttl: Duration,
    samples: Mutex<HashMap<String, CpuSample>>,
}

impl Default for CpuSampleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampleCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SAMPLE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store the new sample and return the one it replaces
    fn swap(&self, key: &str, cpu_time_ns: u64, now: Instant) -> Option<(u64, Instant)> {
        let mut samples = self.samples.lock();
        let ttl = self.ttl;
        samples.retain(|k, s| {
            let keep = now.saturating_duration_since(s.last_read) <= ttl;
            if !keep {
                debug!("Evicting stale CPU sample {}", k);
            }
            keep
        });

        samples
            .insert(
                key.to_string(),
                CpuSample {
                    cpu_time_ns,
                    taken_at: now,
                    last_read: now,
                },
            )
            .map(|prev| (prev.cpu_time_ns, prev.taken_at))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VmStats {
    pub vm: String,
    pub cpu_time_ns: u64,
    pub vcpus: u32,
    /// 0-100, normalised by vCPU count; 0 on the first sample
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_rss_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

impl VmStats {
    /// Query the current counters of `vm` and derive CPU usage from the
    /// previous sample in `cache`
    pub async fn collect(
        exec: &dyn RemoteExec,
        host_id: &str,
        vm: &str,
        cache: &CpuSampleCache,
    ) -> Result<VmStats, VmError> {
        let raw = virsh::run(exec, &DomStats { vm }).await?;
        Ok(Self::from_sample(host_id, vm, &raw, cache, Instant::now()))
    }

    fn from_sample(
        host_id: &str,
        vm: &str,
        raw: &str,
        cache: &CpuSampleCache,
        now: Instant,
    ) -> VmStats {
        let fields = parse_domstats(raw);
        let mut stats = VmStats::from_fields(vm, &fields);

        let key = format!("{}/{}", host_id, vm);
        if let Some((prev_cpu, prev_at)) = cache.swap(&key, stats.cpu_time_ns, now) {
            stats.cpu_percent = cpu_percent(
                prev_cpu,
                stats.cpu_time_ns,
                now.saturating_duration_since(prev_at),
                stats.vcpus,
            );
        }
        stats
    }

    fn from_fields(vm: &str, fields: &HashMap<String, String>) -> VmStats {
        let num = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok());

        let vcpus = num("vcpu.current")
            .or_else(|| num("vcpu.maximum"))
            .unwrap_or(0) as u32;

        VmStats {
            vm: vm.to_string(),
            cpu_time_ns: num("cpu.time").unwrap_or(0),
            vcpus,
            cpu_percent: 0.0,
            memory_bytes: num("balloon.current").unwrap_or(0) * 1024,
            memory_rss_bytes: num("balloon.rss").unwrap_or(0) * 1024,
            net_rx_bytes: sum_indexed(fields, "net", "rx.bytes"),
            net_tx_bytes: sum_indexed(fields, "net", "tx.bytes"),
            block_read_bytes: sum_indexed(fields, "block", "rd.bytes"),
            block_write_bytes: sum_indexed(fields, "block", "wr.bytes"),
        }
    }
}

/// `key=value` lines; the `Domain: 'name'` header and blanks are skipped
pub fn parse_domstats(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Domain:"))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Sum `<prefix>.<i>.<field>` for i = 0, 1, ... until an index is missing
fn sum_indexed(fields: &HashMap<String, String>, prefix: &str, field: &str) -> u64 {
    (0..)
        .map_while(|i| fields.get(&format!("{}.{}.{}", prefix, i, field)))
        .filter_map(|v| v.parse::<u64>().ok())
        .sum()
}

fn cpu_percent(prev_ns: u64, cur_ns: u64, elapsed: Duration, vcpus: u32) -> f64 {
    let elapsed_ns = elapsed.as_nanos() as f64;
    if prev_ns == 0 || elapsed_ns <= 0.0 {
        return 0.0;
    }
    let delta = cur_ns.saturating_sub(prev_ns) as f64;
    let pct = delta / elapsed_ns / f64::from(vcpus.max(1)) * 100.0;
    pct.clamp(0.0, 100.0)
}
