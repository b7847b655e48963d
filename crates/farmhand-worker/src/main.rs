//! Render farm worker binary.

use std::sync::Arc;

use anyhow::Context;
use farmhand_models::ExitStatus;
use farmhand_protocol::{HostInfo, ProtocolClient};
use tracing::{error, info, warn};

use farmhand_worker::logging::init_tracing;
use farmhand_worker::render::RenderRunner;
use farmhand_worker::{CheckpointLog, EngineHandle, HeadlessGui, LocalWork, WorkerConfig, WorkerEngine};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    let checkpoints = Arc::new(CheckpointLog::new());
    init_tracing(Arc::clone(&checkpoints));
    install_panic_hook();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting farmhand worker");

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(ExitStatus::Configuration.code());
        }
    };

    let engine = match build_engine(config, checkpoints) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start worker: {:#}", e);
            std::process::exit(ExitStatus::Configuration.code());
        }
    };

    watch_signals(engine.handle());

    let code = match tokio::spawn(engine.run()).await {
        Ok(Ok(status)) => {
            info!(?status, "Worker exited");
            status.code()
        }
        Ok(Err(e)) => {
            error!("Worker failed: {}", e);
            ExitStatus::Unclassified.code()
        }
        Err(e) if e.is_panic() => {
            error!("Worker panicked");
            ExitStatus::Unclassified.code()
        }
        Err(e) => {
            error!("Worker task failed: {}", e);
            ExitStatus::Unclassified.code()
        }
    };
    std::process::exit(code);
}

fn build_engine(config: WorkerConfig, checkpoints: Arc<CheckpointLog>) -> anyhow::Result<WorkerEngine> {
    let host = HostInfo::detect();
    info!(
        cpu = %host.cpu_model,
        cores = host.cpu_cores,
        memory_kb = host.total_memory_kb,
        os = %host.os_name,
        "Host detected"
    );

    let cores = config.cores.unwrap_or(host.cpu_cores);
    let coordinator = Arc::new(
        ProtocolClient::with_host(config.protocol_config(), host).context("Failed to create coordinator client")?,
    );

    let runner = RenderRunner::new(cores).with_timeout(config.render_timeout);
    let work = Arc::new(LocalWork::new(
        coordinator.clone(),
        config.cache_dir.clone(),
        config.work_dir.clone(),
        runner,
    ));

    let (engine, _handle) = WorkerEngine::new(config, coordinator, work, Arc::new(HeadlessGui::new()), checkpoints);
    Ok(engine)
}

/// Ctrl-C stops the worker; on unix SIGUSR1 pauses and SIGUSR2 resumes it.
fn watch_signals(handle: EngineHandle) {
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.shutdown();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::user_defined1()), signal(SignalKind::user_defined2())) {
            (Ok(mut pause), Ok(mut resume)) => {
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            Some(()) = pause.recv() => {
                                info!("Pause requested");
                                handle.suspend();
                            }
                            Some(()) = resume.recv() => {
                                info!("Resume requested");
                                handle.resume();
                            }
                            else => break,
                        }
                    }
                });
            }
            _ => warn!("Cannot install pause/resume signal handlers"),
        }
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!("Panic: {}\n{}", info, backtrace);
        default_hook(info);
    }));
}
