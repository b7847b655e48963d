//! Machine descriptors sent with configuration and job requests.

use std::fmt;
use std::str::FromStr;

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Which devices the operator lets the coordinator use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeMethod {
    #[default]
    Cpu,
    Gpu,
    CpuGpu,
}

impl ComputeMethod {
    /// Wire value of the `computemethod` parameter.
    pub fn as_param(&self) -> &'static str {
        match self {
            ComputeMethod::CpuGpu => "0",
            ComputeMethod::Cpu => "1",
            ComputeMethod::Gpu => "2",
        }
    }
}

impl FromStr for ComputeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(ComputeMethod::Cpu),
            "gpu" => Ok(ComputeMethod::Gpu),
            "cpu_gpu" | "cpu+gpu" | "both" => Ok(ComputeMethod::CpuGpu),
            other => Err(format!("unknown compute method '{}'", other)),
        }
    }
}

impl fmt::Display for ComputeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputeMethod::Cpu => "cpu",
            ComputeMethod::Gpu => "gpu",
            ComputeMethod::CpuGpu => "cpu_gpu",
        };
        f.write_str(s)
    }
}

/// GPU chosen by the operator. Enumeration itself happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDescriptor {
    pub model: String,
    pub memory_mb: u64,
}

/// Static description of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub cpu_family: String,
    pub cpu_model: String,
    pub cpu_cores: u32,
    pub total_memory_kb: u64,
    pub os_name: String,
    pub arch: String,
    pub hostname: String,
}

impl HostInfo {
    /// Inspect the running machine.
    pub fn detect() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        let (cpu_family, cpu_model) = sys
            .cpus()
            .first()
            .map(|cpu| (cpu.vendor_id().to_string(), cpu.brand().trim().to_string()))
            .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));

        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(sys.cpus().len().max(1) as u32);

        Self {
            cpu_family,
            cpu_model,
            cpu_cores,
            // sysinfo returns bytes
            total_memory_kb: sys.total_memory() / 1024,
            os_name: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            arch: std::env::consts::ARCH.to_string(),
            hostname: System::host_name().unwrap_or_default(),
        }
    }

    /// Pointer width the coordinator expects as `bits`.
    pub fn bits(&self) -> &'static str {
        if self.arch.ends_with("64") {
            "64bit"
        } else {
            "32bit"
        }
    }
}
