use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use lattice_core::config::LocalLauncherConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::event::EventBus;
use lattice_core::traits::EngineLauncher;
use lattice_core::types::{CoordinatorEvent, EngineKind, ProcessState};

use crate::mpi::resolve_prefix;
use crate::port::find_free_port;
use crate::pump::{OutputBuffer, OutputPump};

/// Lines of output quoted back when an engine dies during boot.
const BOOT_FAILURE_TAIL: usize = 20;

/// How long to wait for the output pump to flush after the engine exited.
const PUMP_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Map a symbolic log level to the engine's numeric verbosity flag.
pub fn verbosity(level: &str) -> Option<u32> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(100),
        "debug" => Some(10),
        _ => None,
    }
}

struct EngineProcess {
    child: Child,
    endpoint: String,
    pump: OutputPump,
}

/// Supervises a local (possibly MPI-fanned) engine binary.
///
/// `start` and `stop` are serialized; at most one engine process is alive per
/// launcher. The child is killed if the launcher is dropped while it runs.
pub struct LocalLauncher {
    kind: EngineKind,
    config: LocalLauncherConfig,
    event_bus: Option<Arc<EventBus>>,
    lifecycle: tokio::sync::Mutex<()>,
    process: Mutex<Option<EngineProcess>>,
    output: OutputBuffer,
}

impl LocalLauncher {
    pub fn new(kind: EngineKind, config: LocalLauncherConfig) -> Self {
        let output = OutputBuffer::new(config.output_buffer_lines);
        Self {
            kind,
            config,
            event_bus: None,
            lifecycle: tokio::sync::Mutex::new(()),
            process: Mutex::new(None),
            output,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &LocalLauncherConfig {
        &self.config
    }

    /// Full argv used to launch the engine listening on `port`.
    pub fn command_line(&self, port: u16) -> Vec<String> {
        let mut argv = resolve_prefix(&self.config);
        argv.push(self.config.engine_binary.clone());
        argv.push("--port".to_string());
        argv.push(port.to_string());
        if let Some(ref socket) = self.config.shared_store_socket {
            argv.push("--shared-store-socket".to_string());
            argv.push(socket.clone());
        }
        if let Some(v) = verbosity(&self.config.log_level) {
            argv.push("-v".to_string());
            argv.push(v.to_string());
        }
        argv
    }

    fn launch_error(&self, message: impl Into<String>) -> LatticeError {
        LatticeError::EngineLaunch {
            engine: self.kind,
            message: message.into(),
        }
    }

    fn publish(&self, event: CoordinatorEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }

    async fn launch(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.process.lock().is_some() {
            return Err(self.launch_error("engine already started"));
        }

        let host = self.config.primary_host().to_string();
        let port = find_free_port(
            &host,
            self.config.port_min..=self.config.port_max,
            self.config.max_port_probes,
        )
        .await
        .ok_or_else(|| {
            self.launch_error(format!(
                "no free port on {} in {}..={} after {} probes",
                host, self.config.port_min, self.config.port_max, self.config.max_port_probes
            ))
        })?;

        let argv = self.command_line(port);
        let Some((program, args)) = argv.split_first() else {
            return Err(self.launch_error("empty engine command line"));
        };
        info!(engine = %self.kind, command = %argv.join(" "), "Launching engine");

        self.output.clear();
        let mut child = Command::new(program)
            .args(args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.launch_error(format!("failed to spawn {}: {}", program, e)))?;

        let pump = OutputPump::attach(
            self.kind,
            child.stdout.take(),
            child.stderr.take(),
            self.output.clone(),
            self.config.mirror_output,
        );

        tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                pump.drain(PUMP_DRAIN_GRACE).await;
                let tail = self.output.tail(BOOT_FAILURE_TAIL);
                error!(engine = %self.kind, status = %status, "Engine exited during startup");
                return Err(self.launch_error(format!(
                    "engine exited immediately ({}); last output: {}",
                    status,
                    if tail.is_empty() {
                        "<none>".to_string()
                    } else {
                        tail.join(" | ")
                    }
                )));
            }
            Err(e) => {
                pump.shutdown().await;
                return Err(self.launch_error(format!("failed to check engine status: {}", e)));
            }
        }

        let endpoint = format!("{}:{}", host, port);
        info!(engine = %self.kind, endpoint = %endpoint, pid = ?child.id(), "Engine started");
        *self.process.lock() = Some(EngineProcess {
            child,
            endpoint: endpoint.clone(),
            pump,
        });
        self.publish(CoordinatorEvent::EngineStarted {
            engine: self.kind,
            endpoint,
        });
        Ok(())
    }

    async fn shut_down(&self, is_dangling: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(mut proc) = self.process.lock().take() else {
            debug!(engine = %self.kind, "Engine not running, stop is a no-op");
            return Ok(());
        };

        if is_dangling {
            warn!(engine = %self.kind, "Killing dangling engine");
            kill(&mut proc.child).await;
        } else {
            terminate(&proc.child).await;
            let grace = Duration::from_secs(self.config.stop_timeout_secs);
            match tokio::time::timeout(grace, proc.child.wait()).await {
                Ok(Ok(status)) => info!(engine = %self.kind, status = %status, "Engine exited"),
                Ok(Err(e)) => {
                    warn!(engine = %self.kind, error = %e, "Waiting for engine failed, killing");
                    kill(&mut proc.child).await;
                }
                Err(_) => {
                    warn!(
                        engine = %self.kind,
                        grace_secs = self.config.stop_timeout_secs,
                        "Engine ignored SIGTERM, killing"
                    );
                    kill(&mut proc.child).await;
                }
            }
        }

        proc.pump.shutdown().await;
        info!(engine = %self.kind, endpoint = %proc.endpoint, "Engine stopped");
        self.publish(CoordinatorEvent::EngineStopped { engine: self.kind });
        Ok(())
    }
}

/// Ask the engine to exit with SIGTERM. Delivery failures are only logged;
/// the caller's grace timeout escalates to SIGKILL.
async fn terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let sent = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .await;
    match sent {
        Ok(status) if status.success() => debug!(pid, "Sent SIGTERM"),
        Ok(status) => warn!(pid, status = %status, "kill -TERM failed"),
        Err(e) => warn!(pid, error = %e, "kill -TERM could not run"),
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Engine already gone");
    }
}

impl EngineLauncher for LocalLauncher {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.launch())
    }

    fn stop(&self, is_dangling: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.shut_down(is_dangling))
    }

    fn poll(&self) -> ProcessState {
        let mut guard = self.process.lock();
        match guard.as_mut() {
            None => ProcessState::NotStarted,
            Some(proc) => match proc.child.try_wait() {
                Ok(None) => ProcessState::Running,
                Ok(Some(status)) => ProcessState::Exited(status.code().unwrap_or(-1)),
                Err(_) => ProcessState::Exited(-1),
            },
        }
    }

    fn endpoint(&self) -> Option<String> {
        self.process.lock().as_ref().map(|p| p.endpoint.clone())
    }

    fn recent_output(&self) -> Vec<String> {
        self.output.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    fn config(binary: String) -> LocalLauncherConfig {
        let mut config = LocalLauncherConfig::new(binary);
        config.startup_grace_ms = 200;
        config.stop_timeout_secs = 2;
        config.mirror_output = false;
        config
    }

    #[test]
    fn command_line_includes_optional_flags() {
        let mut cfg = config("grape_engine".into());
        cfg.shared_store_socket = Some("/tmp/store.sock".into());
        cfg.log_level = "DEBUG".into();
        let launcher = LocalLauncher::new(EngineKind::Analytical, cfg);
        assert_eq!(
            launcher.command_line(20001),
            vec![
                "grape_engine",
                "--port",
                "20001",
                "--shared-store-socket",
                "/tmp/store.sock",
                "-v",
                "10"
            ]
        );
    }

    #[test]
    fn command_line_omits_verbosity_at_info() {
        let launcher = LocalLauncher::new(EngineKind::Analytical, config("grape_engine".into()));
        assert_eq!(launcher.command_line(20001), vec!["grape_engine", "--port", "20001"]);
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(verbosity("trace"), Some(100));
        assert_eq!(verbosity("debug"), Some(10));
        assert_eq!(verbosity("info"), None);
        assert_eq!(verbosity("error"), None);
    }

    #[tokio::test]
    async fn start_poll_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_script(dir.path(), "engine.sh", "echo \"engine up on $2\"\nexec sleep 30");
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let launcher =
            LocalLauncher::new(EngineKind::Analytical, config(binary)).with_event_bus(bus);

        assert_eq!(launcher.poll(), ProcessState::NotStarted);
        launcher.start().await.unwrap();
        assert_eq!(launcher.poll(), ProcessState::Running);

        let endpoint = launcher.endpoint().unwrap();
        let port = endpoint.rsplit_once(':').unwrap().1;
        assert!(launcher
            .recent_output()
            .iter()
            .any(|l| l == &format!("engine up on {}", port)));
        assert!(matches!(
            events.recv().await.unwrap(),
            CoordinatorEvent::EngineStarted { engine: EngineKind::Analytical, .. }
        ));

        launcher.stop(false).await.unwrap();
        assert_eq!(launcher.poll(), ProcessState::NotStarted);
        assert!(launcher.endpoint().is_none());

        // Second stop is a no-op.
        launcher.stop(false).await.unwrap();
        assert_eq!(launcher.poll(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_script(dir.path(), "engine.sh", "exec sleep 30");
        let launcher = LocalLauncher::new(EngineKind::Learning, config(binary));

        launcher.start().await.unwrap();
        let first = launcher.endpoint();
        let err = launcher.start().await.unwrap_err();
        assert!(matches!(err, LatticeError::EngineLaunch { engine: EngineKind::Learning, .. }));
        assert_eq!(launcher.endpoint(), first);

        launcher.stop(true).await.unwrap();
        assert_eq!(launcher.poll(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn immediate_exit_fails_start_with_output_tail() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_script(dir.path(), "engine.sh", "echo \"bad flag\" >&2\nexit 3");
        let launcher = LocalLauncher::new(EngineKind::Analytical, config(binary));

        let err = launcher.start().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited immediately"), "{}", message);
        assert!(message.contains("bad flag"), "{}", message);
        assert_eq!(launcher.poll(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn missing_binary_fails_start() {
        let launcher = LocalLauncher::new(
            EngineKind::Analytical,
            config("/nonexistent/lattice-engine".into()),
        );
        assert!(launcher.start().await.is_err());
        assert!(launcher.endpoint().is_none());
    }

    #[tokio::test]
    async fn engine_ignoring_sigterm_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_script(
            dir.path(),
            "engine.sh",
            "trap '' TERM\nwhile true; do sleep 1; done",
        );
        let mut cfg = config(binary);
        cfg.stop_timeout_secs = 1;
        let launcher = LocalLauncher::new(EngineKind::Interactive, cfg);

        launcher.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), launcher.stop(false))
            .await
            .expect("stop should escalate to SIGKILL")
            .unwrap();
        assert_eq!(launcher.poll(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn no_port_in_exhausted_range() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        let mut cfg = config("grape_engine".into());
        cfg.port_min = taken;
        cfg.port_max = taken;
        let launcher = LocalLauncher::new(EngineKind::Analytical, cfg);

        let err = launcher.start().await.unwrap_err();
        assert!(err.to_string().contains("no free port"));
    }
}
