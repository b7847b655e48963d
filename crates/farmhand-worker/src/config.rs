//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use farmhand_protocol::{ComputeMethod, GpuDescriptor, ProtocolConfig};

use crate::error::{WorkerError, WorkerResult};
use crate::schedule::{parse_schedule, ScheduleWindow};

/// Waits and polling periods of the worker loops.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Pause after the coordinator reports itself down, overloaded or in maintenance
    pub server_trouble_cooldown: Duration,
    /// Idle period when the coordinator has no job
    pub no_job_wait: Duration,
    /// Step of the idle period, one status update per step
    pub no_job_poll: Duration,
    /// Pause after a reported error
    pub error_cooldown: Duration,
    /// Backpressure check period while uploads are pending
    pub backpressure_poll: Duration,
    /// Incompatible process scan period
    pub watcher_interval: Duration,
    /// How often the keepalive loop checks whether a ping is due
    pub keepalive_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            server_trouble_cooldown: Duration::from_secs(15 * 60),
            no_job_wait: Duration::from_secs(15 * 60),
            no_job_poll: Duration::from_secs(10),
            error_cooldown: Duration::from_secs(5 * 60),
            backpressure_poll: Duration::from_secs(2),
            watcher_interval: Duration::from_secs(60),
            keepalive_poll: Duration::from_secs(30),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator base URL
    pub server: String,
    pub login: String,
    pub password: String,
    /// Extracted archives and render outputs
    pub work_dir: PathBuf,
    /// Downloaded archives, named by content hash
    pub cache_dir: PathBuf,
    /// Cores offered to the renderer; `None` means all
    pub cores: Option<u32>,
    pub compute_method: ComputeMethod,
    pub gpu: Option<GpuDescriptor>,
    /// Validations allowed to be queued or running before requests pause
    pub max_uploads: usize,
    pub schedule: Vec<ScheduleWindow>,
    /// Process whose presence pauses rendering
    pub incompatible_process: Option<String>,
    pub render_timeout: Option<Duration>,
    pub http_timeout: Duration,
    pub timings: Timings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let work_dir = std::env::temp_dir().join("farmhand");
        Self {
            server: "https://localhost".to_string(),
            login: String::new(),
            password: String::new(),
            cache_dir: work_dir.join("cache"),
            work_dir,
            cores: None,
            compute_method: ComputeMethod::Cpu,
            gpu: None,
            max_uploads: 1,
            schedule: Vec::new(),
            incompatible_process: None,
            render_timeout: None,
            http_timeout: Duration::from_secs(600),
            timings: Timings::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let server = env_string("FARMHAND_SERVER")
            .ok_or_else(|| WorkerError::config_error("FARMHAND_SERVER must be set"))?;
        let login = env_string("FARMHAND_LOGIN")
            .ok_or_else(|| WorkerError::config_error("FARMHAND_LOGIN must be set"))?;
        let password = std::env::var("FARMHAND_PASSWORD")
            .map_err(|_| WorkerError::config_error("FARMHAND_PASSWORD must be set"))?;

        let work_dir = env_string("FARMHAND_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);
        let cache_dir = env_string("FARMHAND_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| work_dir.join("cache"));

        let compute_method = match env_string("FARMHAND_COMPUTE_METHOD") {
            Some(s) => s.parse().map_err(WorkerError::config_error)?,
            None => defaults.compute_method,
        };

        let gpu = env_string("FARMHAND_GPU_MODEL").map(|model| GpuDescriptor {
            model,
            memory_mb: env_parse("FARMHAND_GPU_MEMORY_MB").unwrap_or(0),
        });

        let schedule = match env_string("FARMHAND_SCHEDULE") {
            Some(s) => parse_schedule(&s).map_err(WorkerError::config_error)?,
            None => Vec::new(),
        };

        let config = Self {
            server,
            login,
            password,
            work_dir,
            cache_dir,
            cores: env_parse::<u32>("FARMHAND_CORES").filter(|&c| c > 0),
            compute_method,
            gpu,
            max_uploads: env_parse::<usize>("FARMHAND_MAX_UPLOADS")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_uploads),
            schedule,
            incompatible_process: env_string("FARMHAND_INCOMPATIBLE_PROCESS"),
            render_timeout: env_parse::<u64>("FARMHAND_RENDER_TIMEOUT_SECS")
                .filter(|&s| s > 0)
                .map(Duration::from_secs),
            http_timeout: env_parse::<u64>("FARMHAND_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            timings: Timings::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the values nothing downstream can recover from.
    pub fn validate(&self) -> WorkerResult<()> {
        let url = url::Url::parse(&self.server)
            .map_err(|e| WorkerError::config_error(format!("invalid server URL '{}': {}", self.server, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WorkerError::config_error(format!(
                "server URL must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.login.is_empty() {
            return Err(WorkerError::config_error("login cannot be empty"));
        }
        if self.max_uploads == 0 {
            return Err(WorkerError::config_error("max_uploads must be at least 1"));
        }
        Ok(())
    }

    /// Settings of the coordinator client.
    pub fn protocol_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::new(&self.server, &self.login, &self.password);
        config.compute_method = self.compute_method;
        config.gpu = self.gpu.clone();
        config.cores = self.cores;
        config.timeout = self.http_timeout;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let timings = Timings::default();
        assert_eq!(timings.server_trouble_cooldown, Duration::from_secs(900));
        assert_eq!(timings.no_job_wait, Duration::from_secs(900));
        assert_eq!(timings.error_cooldown, Duration::from_secs(300));
        assert_eq!(timings.watcher_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validate() {
        let mut config = WorkerConfig {
            login: "alice".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.server = "ftp://farm.example.org".to_string();
        assert!(config.validate().unwrap_err().is_config_error());

        config.server = "not a url".to_string();
        assert!(config.validate().is_err());

        config.server = "https://farm.example.org".to_string();
        config.login.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_protocol_config_carries_host_choices() {
        let config = WorkerConfig {
            server: "https://farm.example.org".to_string(),
            login: "alice".to_string(),
            password: "secret".to_string(),
            cores: Some(4),
            compute_method: ComputeMethod::Gpu,
            http_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let protocol = config.protocol_config();
        assert_eq!(protocol.base_url, "https://farm.example.org");
        assert_eq!(protocol.cores, Some(4));
        assert_eq!(protocol.compute_method, ComputeMethod::Gpu);
        assert_eq!(protocol.timeout, Duration::from_secs(30));
    }
}
