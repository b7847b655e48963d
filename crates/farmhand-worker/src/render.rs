//! Renderer command line and supervised execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use farmhand_models::{ErrorKind, Job};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::control::KillReason;

/// Paths and settings substituted into the renderer command line.
#[derive(Debug, Clone)]
pub struct RenderParams {
    pub renderer: PathBuf,
    pub scene: PathBuf,
    /// Output prefix, `<work_dir>/<job>_<frame>_`
    pub output_prefix: PathBuf,
    pub frame: u64,
    pub cores: u32,
    pub use_gpu: bool,
}

/// A renderer invocation built from the job's command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RenderCommand {
    /// Split the template on whitespace and substitute the placeholders.
    pub fn from_template(template: &str, params: &RenderParams) -> Result<Self, ErrorKind> {
        let renderer = params.renderer.to_string_lossy();
        let scene = params.scene.to_string_lossy();
        let output = params.output_prefix.to_string_lossy();
        let frame = params.frame.to_string();
        let cores = params.cores.to_string();
        let device = if params.use_gpu { "GPU" } else { "CPU" };

        let mut tokens = template.split_whitespace().map(|token| {
            token
                .replace("%RENDERER%", &renderer)
                .replace("%SCENE%", &scene)
                .replace("%OUTPUT%", &output)
                .replace("%FRAME%", &frame)
                .replace("%CORES%", &cores)
                .replace("%DEVICE%", device)
        });

        let program = tokens.next().ok_or(ErrorKind::FailedToExecute)?;
        Ok(Self {
            program,
            args: tokens.collect(),
        })
    }
}

/// What the output scanner saw.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputScan {
    pub peak_memory_kb: u64,
    pub failure: Option<ErrorKind>,
}

impl OutputScan {
    /// Fold one renderer output line in.
    pub fn observe(&mut self, line: &str) {
        if let Some(kb) = parse_memory_kb(line) {
            self.peak_memory_kb = self.peak_memory_kb.max(kb);
        }
        if self.failure.is_none() {
            if line.contains("error while loading shared libraries") {
                self.failure = Some(ErrorKind::RendererMissingLibraries);
            } else if line.contains("No space left on device") {
                self.failure = Some(ErrorKind::NoSpaceLeftOnDevice);
            }
        }
    }

    fn merge(mut self, other: OutputScan) -> Self {
        self.peak_memory_kb = self.peak_memory_kb.max(other.peak_memory_kb);
        self.failure = self.failure.or(other.failure);
        self
    }
}

fn memory_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:Mem|Peak):\s*([0-9]+(?:\.[0-9]+)?)\s*([KMG])?").ok())
        .as_ref()
}

/// Largest `Mem:`/`Peak:` figure of a line, in KB.
fn parse_memory_kb(line: &str) -> Option<u64> {
    memory_pattern()?
        .captures_iter(line)
        .filter_map(|caps| {
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            let factor = match caps.get(2).map(|m| m.as_str()) {
                Some("G") => 1024.0 * 1024.0,
                Some("M") => 1024.0,
                _ => 1.0,
            };
            Some((value * factor) as u64)
        })
        .max()
}

/// Final verdict on a render.
///
/// A kill wins over everything, then markers seen in the output, then the
/// exit code, then the presence of an output file.
pub fn classify(
    killed: Option<KillReason>,
    scan: &OutputScan,
    exited_ok: bool,
    output: Option<PathBuf>,
) -> Result<PathBuf, ErrorKind> {
    if let Some(reason) = killed {
        return Err(reason.error_kind());
    }
    if let Some(failure) = scan.failure {
        return Err(failure);
    }
    if !exited_ok {
        return Err(ErrorKind::RendererCrashed);
    }
    output.ok_or(ErrorKind::NoOutputFile)
}

/// First file in `dir` whose name starts with `prefix`.
pub async fn find_output(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut matches = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && entry.file_name().to_string_lossy().starts_with(prefix) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    matches.into_iter().next()
}

/// How long to keep reading renderer output once the process is gone.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Runner for renderer processes with kill and timeout handling.
#[derive(Debug, Clone)]
pub struct RenderRunner {
    cores: u32,
    timeout: Option<Duration>,
}

impl RenderRunner {
    pub fn new(cores: u32) -> Self {
        Self {
            cores: cores.max(1),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// Run the renderer for `job` and record the output path.
    ///
    /// `kill` must have been marked seen when the job started: only kills
    /// issued since then stop this render.
    pub async fn run(
        &self,
        job: &mut Job,
        command: &RenderCommand,
        work_dir: &Path,
        kill: &watch::Receiver<Option<KillReason>>,
    ) -> Result<(), ErrorKind> {
        let mut kill = kill.clone();
        if kill.has_changed().unwrap_or(false) {
            if let Some(reason) = *kill.borrow_and_update() {
                info!(job_id = %job.id, %reason, "Render cancelled before start");
                return Err(reason.error_kind());
            }
        }

        debug!("Running renderer: {} {}", command.program, command.args.join(" "));
        let mut renderer = Command::new(&command.program);
        renderer
            .args(&command.args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so helpers forked by the renderer die with it.
        #[cfg(unix)]
        renderer.process_group(0);
        let mut child = renderer
            .spawn()
            .map_err(|e| {
                warn!(program = %command.program, "Failed to start renderer: {}", e);
                ErrorKind::FailedToExecute
            })?;

        job.process.start(child.id(), self.cores);
        info!(job_id = %job.id, frame = job.frame_number, pid = ?child.id(), "Renderer started");

        let stdout = child.stdout.take().map(|out| tokio::spawn(scan_output(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(scan_output(err)));

        let deadline = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let stopped = tokio::select! {
            status = child.wait() => Ok(status),
            reason = wait_for_kill(&mut kill) => Err(reason),
            _ = deadline => Err(KillReason::Timeout),
        };

        let (killed, exited_ok) = match stopped {
            Ok(Ok(status)) => {
                debug!(job_id = %job.id, ?status, "Renderer exited");
                (None, status.success())
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, "Failed to wait for renderer: {}", e);
                (None, false)
            }
            Err(reason) => {
                warn!(job_id = %job.id, %reason, "Killing renderer");
                kill_process_tree(&mut child).await;
                (Some(reason), false)
            }
        };

        let mut scan = OutputScan::default();
        for mut task in [stdout, stderr].into_iter().flatten() {
            match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await {
                Ok(Ok(part)) => scan = scan.merge(part),
                Ok(Err(e)) => warn!(job_id = %job.id, "Renderer output reader failed: {}", e),
                Err(_) => {
                    warn!(job_id = %job.id, "Renderer output still open, abandoning it");
                    task.abort();
                }
            }
        }
        job.process.record_memory(scan.peak_memory_kb);
        job.process.finish();

        let output = find_output(work_dir, &job.output_prefix()).await;
        let output = classify(killed, &scan, exited_ok, output)?;
        info!(
            job_id = %job.id,
            frame = job.frame_number,
            render_secs = job.process.duration().as_secs(),
            memory_kb = job.process.memory_used_kb,
            "Render finished"
        );
        job.output_image_path = Some(output);
        Ok(())
    }
}

/// Kill the renderer and everything in its process group.
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(pid, "Failed to kill renderer process group: {}", e);
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Failed to kill renderer: {}", e);
    }
}

async fn scan_output<R: AsyncRead + Unpin>(stream: R) -> OutputScan {
    let mut lines = BufReader::new(stream).lines();
    let mut scan = OutputScan::default();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "renderer", "{}", line);
        scan.observe(&line);
    }
    scan
}

/// Resolve on the next kill request. Never resolves once the sender is gone.
async fn wait_for_kill(kill: &mut watch::Receiver<Option<KillReason>>) -> KillReason {
    loop {
        if kill.changed().await.is_err() {
            return std::future::pending().await;
        }
        if let Some(reason) = *kill.borrow_and_update() {
            return reason;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RenderParams {
        RenderParams {
            renderer: PathBuf::from("/work/rrrr/rend.exe"),
            scene: PathBuf::from("/work/ssss/main.blend"),
            output_prefix: PathBuf::from("/work/42_7_"),
            frame: 7,
            cores: 4,
            use_gpu: true,
        }
    }

    #[test]
    fn test_template_substitution() {
        let cmd = RenderCommand::from_template(
            "%RENDERER% -b %SCENE% -o %OUTPUT% -f %FRAME% -t %CORES% --device %DEVICE%",
            &params(),
        )
        .unwrap();
        assert_eq!(cmd.program, "/work/rrrr/rend.exe");
        assert_eq!(
            cmd.args,
            vec!["-b", "/work/ssss/main.blend", "-o", "/work/42_7_", "-f", "7", "-t", "4", "--device", "GPU"]
        );
    }

    #[test]
    fn test_empty_template() {
        assert_eq!(
            RenderCommand::from_template("   ", &params()),
            Err(ErrorKind::FailedToExecute)
        );
    }

    #[test]
    fn test_output_scan() {
        let mut scan = OutputScan::default();
        scan.observe("Fra:7 Mem:120.50M (Peak 130M) | Time:00:01.00");
        scan.observe("Fra:7 Mem:90M Peak:1.5G");
        assert_eq!(scan.peak_memory_kb, 1536 * 1024);
        assert_eq!(scan.failure, None);

        scan.observe("rend.exe: error while loading shared libraries: libGL.so.1");
        scan.observe("write failed: No space left on device");
        assert_eq!(scan.failure, Some(ErrorKind::RendererMissingLibraries));
    }

    #[test]
    fn test_classification_order() {
        let clean = OutputScan::default();
        let out = Some(PathBuf::from("/work/42_7_0007.png"));

        assert_eq!(
            classify(Some(KillReason::Server), &clean, true, out.clone()),
            Err(ErrorKind::RendererKilledByServer)
        );
        let no_space = OutputScan {
            peak_memory_kb: 0,
            failure: Some(ErrorKind::NoSpaceLeftOnDevice),
        };
        assert_eq!(classify(None, &no_space, false, None), Err(ErrorKind::NoSpaceLeftOnDevice));
        assert_eq!(classify(None, &clean, false, out.clone()), Err(ErrorKind::RendererCrashed));
        assert_eq!(classify(None, &clean, true, None), Err(ErrorKind::NoOutputFile));
        assert_eq!(classify(None, &clean, true, out.clone()), Ok(out.unwrap()));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use farmhand_models::{JobId, RenderProcessHandle};
        use std::os::unix::fs::PermissionsExt;

        fn job() -> Job {
            Job {
                id: JobId::from_string("42"),
                frame_number: 7,
                scene_md5: "ssss".to_string(),
                renderer_md5: "rrrr".to_string(),
                path: "main.blend".to_string(),
                renderer_command: "%RENDERER% %OUTPUT%".to_string(),
                use_gpu: false,
                extras: String::new(),
                revision: "1".to_string(),
                name: None,
                archive_password: None,
                validation_url: None,
                output_image_path: None,
                process: RenderProcessHandle::default(),
            }
        }

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("rend.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn command(renderer: &Path, work_dir: &Path, job: &Job) -> RenderCommand {
            let params = RenderParams {
                renderer: renderer.to_path_buf(),
                scene: work_dir.join("main.blend"),
                output_prefix: work_dir.join(job.output_prefix()),
                frame: job.frame_number,
                cores: 2,
                use_gpu: false,
            };
            RenderCommand::from_template(&job.renderer_command, &params).unwrap()
        }

        #[tokio::test]
        async fn test_successful_render() {
            let dir = tempfile::tempdir().unwrap();
            let renderer = script(dir.path(), "echo 'Mem:64M Peak:80M'\ntouch \"${1}0007.png\"");
            let mut job = job();
            let cmd = command(&renderer, dir.path(), &job);
            let (_tx, rx) = watch::channel(None);

            RenderRunner::new(2).run(&mut job, &cmd, dir.path(), &rx).await.unwrap();

            assert_eq!(job.output_image_path, Some(dir.path().join("42_7_0007.png")));
            assert_eq!(job.process.memory_used_kb, 80 * 1024);
            assert_eq!(job.process.cores_used, 2);
            assert!(!job.process.is_running());
        }

        #[tokio::test]
        async fn test_crash_and_missing_output() {
            let dir = tempfile::tempdir().unwrap();
            let (_tx, rx) = watch::channel(None);

            let crasher = script(dir.path(), "exit 3");
            let mut job = job();
            let cmd = command(&crasher, dir.path(), &job);
            let result = RenderRunner::new(1).run(&mut job, &cmd, dir.path(), &rx).await;
            assert_eq!(result, Err(ErrorKind::RendererCrashed));

            let silent = script(dir.path(), "exit 0");
            let cmd = command(&silent, dir.path(), &job);
            let result = RenderRunner::new(1).run(&mut job, &cmd, dir.path(), &rx).await;
            assert_eq!(result, Err(ErrorKind::NoOutputFile));
        }

        #[tokio::test]
        async fn test_missing_binary() {
            let dir = tempfile::tempdir().unwrap();
            let (_tx, rx) = watch::channel(None);
            let mut job = job();
            let cmd = command(&dir.path().join("nope"), dir.path(), &job);
            let result = RenderRunner::new(1).run(&mut job, &cmd, dir.path(), &rx).await;
            assert_eq!(result, Err(ErrorKind::FailedToExecute));
        }

        #[tokio::test]
        async fn test_kill_stops_render() {
            let dir = tempfile::tempdir().unwrap();
            let renderer = script(dir.path(), "sleep 30");
            let mut job = job();
            let cmd = command(&renderer, dir.path(), &job);
            let (tx, rx) = watch::channel(None);

            let killer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                tx.send_replace(Some(KillReason::Server));
                tx
            });

            let started = std::time::Instant::now();
            let result = RenderRunner::new(1).run(&mut job, &cmd, dir.path(), &rx).await;
            assert_eq!(result, Err(ErrorKind::RendererKilledByServer));
            assert!(started.elapsed() < Duration::from_secs(3));
            drop(killer.await.unwrap());
        }

        #[tokio::test]
        async fn test_kill_reaches_forked_helpers() {
            let dir = tempfile::tempdir().unwrap();
            // The helper inherits stdout, so the output drain only ends once it is gone.
            let renderer = script(dir.path(), "sleep 30 &\nsleep 30 &\nwait");
            let mut job = job();
            let cmd = command(&renderer, dir.path(), &job);
            let (tx, rx) = watch::channel(None);

            let killer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                tx.send_replace(Some(KillReason::User));
                tx
            });

            let started = std::time::Instant::now();
            let result = RenderRunner::new(1).run(&mut job, &cmd, dir.path(), &rx).await;
            assert_eq!(result, Err(ErrorKind::RendererKilledByUser));
            assert!(started.elapsed() < Duration::from_secs(3));
            drop(killer.await.unwrap());
        }

        #[tokio::test]
        async fn test_stale_kill_is_ignored() {
            let dir = tempfile::tempdir().unwrap();
            let renderer = script(dir.path(), "touch \"${1}0007.png\"");
            let mut job = job();
            let cmd = command(&renderer, dir.path(), &job);

            let (tx, mut rx) = watch::channel(None);
            tx.send_replace(Some(KillReason::Server));
            rx.borrow_and_update();

            assert!(RenderRunner::new(1).run(&mut job, &cmd, dir.path(), &rx).await.is_ok());
        }

        #[tokio::test]
        async fn test_timeout_kills() {
            let dir = tempfile::tempdir().unwrap();
            let renderer = script(dir.path(), "sleep 30");
            let mut job = job();
            let cmd = command(&renderer, dir.path(), &job);
            let (_tx, rx) = watch::channel(None);

            let runner = RenderRunner::new(1).with_timeout(Some(Duration::from_millis(200)));
            let started = std::time::Instant::now();
            let result = runner.run(&mut job, &cmd, dir.path(), &rx).await;
            assert_eq!(result, Err(ErrorKind::RendererKilled));
            assert!(started.elapsed() < Duration::from_secs(3));
        }
    }
}
