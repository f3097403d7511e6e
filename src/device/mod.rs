//! Compute device discovery and description.
//!
//! Devices are discovered once at startup behind a lazy global and never
//! rediscovered; hot-plug is out of scope. Tests and embedders can seed
//! the list before first use.

use std::fmt;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Which backend library drives a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryKind {
    Cpu,
    Cuda,
    Rocm,
    Metal,
    Vulkan,
    OneApi,
}

impl fmt::Display for LibraryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LibraryKind::Cpu => "cpu",
            LibraryKind::Cuda => "cuda",
            LibraryKind::Rocm => "rocm",
            LibraryKind::Metal => "metal",
            LibraryKind::Vulkan => "vulkan",
            LibraryKind::OneApi => "oneapi",
        };
        f.write_str(s)
    }
}

/// Stable device identity: library plus the library's own id string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub library: String,
    pub id: String,
}

impl DeviceId {
    pub fn new(library: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            id: id.into(),
        }
    }

    pub fn cpu() -> Self {
        Self::new("cpu", "0")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.library, self.id)
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        DeviceId::cpu()
    }
}

/// Everything the supervisor and the `/info` endpoint report per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable identity.
    pub id: DeviceId,

    /// Human-readable name (e.g. "NVIDIA GeForce RTX 4090").
    pub name: String,

    /// Driving library.
    pub library: LibraryKind,

    /// Total memory in bytes.
    pub total_memory: u64,

    /// Free memory in bytes at discovery time.
    pub free_memory: u64,

    /// Whether this is an integrated GPU sharing system RAM.
    pub integrated: bool,

    /// Compute capability.
    pub compute_major: u32,
    pub compute_minor: u32,

    /// Driver version.
    pub driver_major: u32,
    pub driver_minor: u32,

    /// Search paths for the backend library.
    pub library_path: Vec<String>,

    /// PCI bus id, empty for non-PCI devices.
    pub pci_id: String,
}

impl DeviceInfo {
    pub fn is_cpu(&self) -> bool {
        self.library == LibraryKind::Cpu
    }

    /// Ordering weight within a library group: newer compute capability and
    /// more memory first.
    pub fn performance_key(&self) -> (u32, u32, u64) {
        (self.compute_major, self.compute_minor, self.total_memory)
    }
}

/// Host memory and thread facts used by the planner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemInfo {
    pub total_memory: u64,
    pub free_memory: u64,
    pub free_swap: u64,
    pub thread_count: usize,
}

impl SystemInfo {
    /// Probe the host. Falls back to conservative defaults on platforms
    /// without /proc.
    pub fn detect() -> Self {
        let thread_count = num_cpus::get_physical();
        match read_proc_meminfo() {
            Some((total, free, swap)) => Self {
                total_memory: total,
                free_memory: free,
                free_swap: swap,
                thread_count,
            },
            None => Self {
                total_memory: 16 << 30,
                free_memory: 8 << 30,
                free_swap: 0,
                thread_count,
            },
        }
    }
}

fn read_proc_meminfo() -> Option<(u64, u64, u64)> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = 0u64;
    let mut available = 0u64;
    let mut swap_free = 0u64;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let kb: u64 = parts.next()?.parse().ok()?;
        match key {
            "MemTotal:" => total = kb * 1024,
            "MemAvailable:" => available = kb * 1024,
            "SwapFree:" => swap_free = kb * 1024,
            _ => {}
        }
    }
    Some((total, available, swap_free))
}

static DEVICES: OnceCell<Vec<DeviceInfo>> = OnceCell::new();

/// Seed the global device list. First caller wins; returns false if the
/// list was already initialized.
pub fn seed_devices(devices: Vec<DeviceInfo>) -> bool {
    DEVICES.set(devices).is_ok()
}

/// The process-wide device list, discovered on first use.
pub fn devices() -> &'static [DeviceInfo] {
    DEVICES.get_or_init(|| {
        let found = discover();
        info!(count = found.len(), "discovered compute devices");
        found
    })
}

/// GPU devices only, in discovery order.
pub fn gpus() -> Vec<DeviceInfo> {
    devices().iter().filter(|d| !d.is_cpu()).cloned().collect()
}

/// Enumerate devices. Without a linked accelerator backend only the CPU
/// device is reported; the backend seam replaces this at integration time.
fn discover() -> Vec<DeviceInfo> {
    let sys = SystemInfo::detect();
    vec![DeviceInfo {
        id: DeviceId::cpu(),
        name: "CPU".to_string(),
        library: LibraryKind::Cpu,
        total_memory: sys.total_memory,
        free_memory: sys.free_memory,
        integrated: false,
        compute_major: 0,
        compute_minor: 0,
        driver_major: 0,
        driver_minor: 0,
        library_path: Vec::new(),
        pci_id: String::new(),
    }]
}

/// Synthetic discrete GPU for planner and supervisor tests.
pub fn synthetic_gpu(index: usize, free: u64) -> DeviceInfo {
    DeviceInfo {
        id: DeviceId::new("cuda", index.to_string()),
        name: format!("Synthetic GPU {index}"),
        library: LibraryKind::Cuda,
        total_memory: free + (1 << 30),
        free_memory: free,
        integrated: false,
        compute_major: 8,
        compute_minor: 6,
        driver_major: 12,
        driver_minor: 4,
        library_path: Vec::new(),
        pci_id: format!("0000:{index:02x}:00.0"),
    }
}
