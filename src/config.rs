use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::descriptor::{parse_size, Resources};
use crate::scheduler::WorkerAdvertisement;

const GIB: u64 = 1 << 30;

/// Configuration for Docker-based job execution.
///
/// Every job runs in a sandboxed container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem, writable scratch mount
/// - GPU, CPU and memory limits taken from the job's grant
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container engine CLI to invoke
    pub docker_binary: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Mount the container root filesystem read-only
    pub read_only_root: bool,
    /// Host directory under which per-attempt scratch directories are created
    pub scratch_root: PathBuf,
    /// Mount point of the scratch directory inside the container
    pub container_workdir: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            network_disabled: true,
            read_only_root: true,
            scratch_root: std::env::temp_dir().join("condor-lite").join("scratch"),
            container_workdir: "/scratch".to_string(),
        }
    }
}

/// Artifact store backend settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the artifact store
    pub root: PathBuf,
    /// Upper bound for a single fetch or push
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
            timeout_ms: 30_000,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Scheduling policy knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Largest request a single job may make
    pub resource_caps: Resources,
    /// Submissions are rejected while this many jobs are not terminal
    pub max_active_jobs: usize,
    /// A worker silent for this long is considered lost
    pub heartbeat_timeout_ms: u64,
    /// Period of the scheduling pass
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            resource_caps: Resources::new(8, 128, 1024 * GIB, 10 * 1024 * GIB),
            max_active_jobs: 10_000,
            heartbeat_timeout_ms: 15_000,
            tick_interval_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    /// Workers hosted by this process; the node heartbeats them itself.
    pub local_workers: Vec<WorkerAdvertisement>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:9618"
                .parse()
                .expect("default listen address is valid"),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
            sandbox: SandboxConfig::default(),
            local_workers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_local_worker(mut self, advertisement: WorkerAdvertisement) -> Self {
        self.local_workers.push(advertisement);
        self
    }
}

/// Settings for a standalone worker agent that advertises itself to a server.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: String,
    pub advertisement: WorkerAdvertisement,
    pub heartbeat_interval_ms: u64,
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Parse a worker description such as
/// `gpu-1,gpus=1,cpus=4,memory=128GB,disk=50GB,jobLength=short`.
///
/// The first field is the worker id. `gpus`, `cpus`, `memory`, `disk` and
/// `endpoint` are reserved keys; any other `key=value` becomes a label. Bare
/// memory is MiB and bare disk is KiB, as in submit files.
pub fn parse_worker_spec(text: &str) -> Result<WorkerAdvertisement, String> {
    let mut fields = text.split(',').map(str::trim);
    let worker_id = match fields.next() {
        Some(id) if !id.is_empty() && !id.contains('=') => id,
        _ => return Err(format!("worker spec must start with an id: {:?}", text)),
    };

    let mut advertisement = WorkerAdvertisement::new(worker_id, Resources::default());
    for field in fields.filter(|f| !f.is_empty()) {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got {:?}", field))?;
        let (key, value) = (key.trim(), value.trim());
        let invalid = || format!("invalid {} value {:?}", key, value);
        let capacity = &mut advertisement.capacity;
        match key {
            "gpus" => capacity.gpus = value.parse().map_err(|_| invalid())?,
            "cpus" => capacity.cpus = value.parse().map_err(|_| invalid())?,
            "memory" => capacity.memory_bytes = parse_size(value, 1 << 20).ok_or_else(invalid)?,
            "disk" => capacity.disk_bytes = parse_size(value, 1 << 10).ok_or_else(invalid)?,
            "endpoint" => advertisement.endpoint = Some(value.to_string()),
            _ => {
                advertisement.labels.insert(key.to_string(), value.to_string());
            }
        }
    }
    Ok(advertisement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.docker_binary, "docker");
        assert!(cfg.network_disabled);
        assert!(cfg.read_only_root);
        assert!(cfg.scratch_root.ends_with("condor-lite/scratch"));
        assert_eq!(cfg.container_workdir, "/scratch");
    }

    #[test]
    fn storage_config_default() {
        let cfg = StorageConfig::default();
        assert_eq!(cfg.root, PathBuf::from("artifacts"));
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_active_jobs, 10_000);
        assert_eq!(cfg.resource_caps.gpus, 8);
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.tick_interval(), Duration::from_millis(500));
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9618");
        assert!(cfg.local_workers.is_empty());
    }

    #[test]
    fn node_config_with_local_worker() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new(addr)
            .with_local_worker(WorkerAdvertisement::new("gpu-1", Resources::new(1, 4, 1, 1)))
            .with_local_worker(WorkerAdvertisement::new("gpu-2", Resources::new(2, 8, 1, 1)));
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.local_workers.len(), 2);
        assert_eq!(cfg.local_workers[0].worker_id, "gpu-1");
        assert_eq!(cfg.local_workers[1].capacity.gpus, 2);
    }

    #[test]
    fn parse_worker_spec_reads_capacity_and_labels() {
        let w = parse_worker_spec(
            "gpu-1, gpus=1, cpus=4, memory=128GB, disk=50GB, jobLength=short, flockingAllowed=true",
        )
        .unwrap();
        assert_eq!(w.worker_id, "gpu-1");
        assert_eq!(w.capacity, Resources::new(1, 4, 128_000_000_000, 50_000_000_000));
        assert_eq!(w.labels.get("jobLength").map(String::as_str), Some("short"));
        assert_eq!(w.labels.get("flockingAllowed").map(String::as_str), Some("true"));
        assert!(w.endpoint.is_none());
    }

    #[test]
    fn parse_worker_spec_bare_units_and_endpoint() {
        let w = parse_worker_spec("w,memory=512,disk=1024,endpoint=tcp://10.0.0.2:2375").unwrap();
        assert_eq!(w.capacity.memory_bytes, 512 << 20);
        assert_eq!(w.capacity.disk_bytes, 1 << 20);
        assert_eq!(w.endpoint.as_deref(), Some("tcp://10.0.0.2:2375"));
    }

    #[test]
    fn parse_worker_spec_rejects_garbage() {
        assert!(parse_worker_spec("").is_err());
        assert!(parse_worker_spec("cpus=4").is_err());
        assert!(parse_worker_spec("w,cpus=four").is_err());
        assert!(parse_worker_spec("w,memory").is_err());
    }
}
