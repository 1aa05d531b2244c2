//! Privileged script execution gateway.
//!
//! Every script launch goes through [`ScriptGateway::run`], which applies
//! the following gates in order and never lets an error escape:
//!
//! 1. path, existence and action-id validation ([`guard`])
//! 2. content hash capture ([`integrity`])
//! 3. admission into a bounded pool (`max_concurrency` slots)
//! 4. hash re-verification right before spawn (TOCTOU defense)
//! 5. spawn, real-time output streaming, exit wait under caller
//!    cancellation, global cancellation and a fixed timeout
//!
//! The return value is the script's exit code, or [`SENTINEL_EXIT_CODE`]
//! when the run was rejected, failed to start, timed out or was cancelled.

pub mod cancel;
pub mod guard;
pub mod integrity;
pub mod launcher;
pub mod registry;

use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, GatewayConfig};
use crate::telemetry::{ActionTelemetry, TelemetryRecorder};
use cancel::CancelSwitch;
use launcher::Launcher;
use registry::{kill_tree, ProcessRegistry};

/// Exit code reported when no real process exit code exists.
pub const SENTINEL_EXIT_CODE: i32 = -1;

/// Frame line around every invocation's output.
pub const SEPARATOR: &str = "════════════════════════════════════════════════";

const CANCELLED_NOTICE: &str = "[!] Operation cancelled by user";

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives script output and gateway status lines as they happen.
pub trait OutputSink: Send + Sync {
    fn line(&self, line: &str);
}

impl<F> OutputSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn line(&self, line: &str) {
        self(line)
    }
}

/// One invocation, owned by the caller.
pub struct ExecutionRequest {
    pub script_path: PathBuf,
    pub action: Option<String>,
    pub sink: Option<Arc<dyn OutputSink>>,
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            action: None,
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Anything that can run a script request to an exit code.
///
/// The restore gate depends on this rather than on [`ScriptGateway`]
/// directly.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run_script(&self, request: ExecutionRequest) -> i32;
}

/// Why a launched (or about to be launched) script has no exit code.
#[derive(Debug)]
enum RunFailure {
    Integrity {
        expected: Option<String>,
        actual: Option<String>,
    },
    Spawn(io::Error),
    Wait(io::Error),
    Timeout,
    Cancelled,
}

enum AdmissionDenied {
    Cancelled,
    Closed,
}

/// Validates, rate-limits, launches, supervises and cancels scripts.
///
/// Holds all of its shared state itself, so independent instances never
/// interfere.
pub struct ScriptGateway {
    base_dir: OnceLock<PathBuf>,
    launcher: Launcher,
    permits: Semaphore,
    registry: ProcessRegistry,
    cancel: CancelSwitch,
    timeout: Duration,
    telemetry: Arc<dyn TelemetryRecorder>,
}

impl ScriptGateway {
    pub fn new(
        settings: &GatewayConfig,
        launcher: Launcher,
        telemetry: Arc<dyn TelemetryRecorder>,
    ) -> Self {
        Self {
            base_dir: OnceLock::new(),
            launcher,
            permits: Semaphore::new(settings.max_concurrency.max(1)),
            registry: ProcessRegistry::new(),
            cancel: CancelSwitch::new(settings.cancel_grace()),
            timeout: settings.timeout(),
            telemetry,
        }
    }

    pub fn from_config(config: &Config, telemetry: Arc<dyn TelemetryRecorder>) -> Self {
        let launcher = Launcher::from_config(&config.interpreter, &config.gateway.log_dir);
        Self::new(&config.gateway, launcher, telemetry)
    }

    /// Sets the directory all scripts must live under. Write-once.
    pub fn set_base_directory(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        info!("Scripts base directory: {}", dir.display());
        self.base_dir
            .set(dir)
            .map_err(|dir| anyhow!("Base directory already set, refusing {}", dir.display()))
    }

    pub fn base_directory(&self) -> Option<&Path> {
        self.base_dir.get().map(PathBuf::as_path)
    }

    pub fn is_valid_script_path(&self, path: &Path) -> bool {
        guard::is_valid_script_path(path, self.base_directory())
    }

    /// Whether the configured interpreter binary exists.
    pub fn interpreter_available(&self) -> bool {
        self.launcher.is_available()
    }

    pub fn has_active_operations(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn active_operations(&self) -> usize {
        self.registry.len()
    }

    /// True between a [`cancel_all`](Self::cancel_all) and the installation
    /// of the next cancellation token.
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs one script. See the module docs for the gate order.
    pub async fn run(&self, request: ExecutionRequest) -> i32 {
        let ExecutionRequest {
            script_path,
            action,
            sink,
            cancel,
        } = request;
        let script = script_path.as_path();
        let action = action.as_deref();
        let sink = sink.as_deref();

        if !self.is_valid_script_path(script) {
            let message = format!("Invalid script path: {}", script.display());
            return self.reject(&message, script, action, sink);
        }
        if !tokio::fs::metadata(script)
            .await
            .is_ok_and(|meta| meta.is_file())
        {
            let message = format!("Script not found: {}", script.display());
            return self.reject(&message, script, action, sink);
        }
        if let Some(action) = action {
            if !guard::is_valid_action(action) {
                let message = format!("Invalid action parameter: {action}");
                return self.reject(&message, script, action.into(), sink);
            }
        }

        let expected_hash = integrity::compute_hash(script).await;
        let global = self.cancel.current();
        let name = script_name(script);

        emit(sink, SEPARATOR);
        emit(sink, &format!("  Starting: {name}"));
        emit(sink, SEPARATOR);
        info!(
            "Running script: {} (action={})",
            script.display(),
            action.unwrap_or("none")
        );

        let _permit = match self.admit(&cancel, &global).await {
            Ok(permit) => permit,
            Err(AdmissionDenied::Cancelled) => {
                emit(sink, CANCELLED_NOTICE);
                info!("Cancelled while waiting for a slot: {}", script.display());
                self.record(&name, action, SENTINEL_EXIT_CODE, 0);
                return SENTINEL_EXIT_CODE;
            }
            Err(AdmissionDenied::Closed) => {
                emit(sink, "Error: Script gateway has been shut down");
                warn!("Run requested after shutdown: {}", script.display());
                self.record(&name, action, SENTINEL_EXIT_CODE, 0);
                return SENTINEL_EXIT_CODE;
            }
        };

        let started = Instant::now();
        let exit_code = self
            .execute(script, action, expected_hash, sink, &cancel, &global)
            .await;
        self.record(&name, action, exit_code, elapsed_ms(started));
        exit_code
    }

    /// Cancels every running and queued invocation, kills all tracked
    /// process trees and empties the registry. A fresh cancellation token
    /// is installed after the grace interval.
    pub fn cancel_all(&self) {
        info!(
            "Cancellation requested for all operations ({} running)",
            self.active_operations()
        );
        let generation = self.cancel.trip();
        let terminated = self.registry.terminate_all();
        info!("Cancellation generation {generation}: terminated {terminated} process tree(s)");
    }

    /// Terminal: kills everything and closes admission. The gateway
    /// rejects every later run.
    pub fn shutdown(&self) {
        let terminated = self.registry.terminate_all();
        self.cancel.close();
        self.permits.close();
        info!(
            "Script gateway shut down ({terminated} process tree(s) terminated, {} cancellation round(s))",
            self.cancel.generation()
        );
    }

    async fn admit(
        &self,
        cancel: &CancellationToken,
        global: &CancellationToken,
    ) -> Result<SemaphorePermit<'_>, AdmissionDenied> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdmissionDenied::Cancelled),
            _ = global.cancelled() => Err(AdmissionDenied::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| AdmissionDenied::Closed),
        }
    }

    /// Runs with a slot held: integrity re-check, launch, summary frame.
    async fn execute(
        &self,
        script: &Path,
        action: Option<&str>,
        expected_hash: Option<String>,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
        global: &CancellationToken,
    ) -> i32 {
        if let Err(failure) = verify_integrity(script, expected_hash).await {
            return self.report_failure(script, failure, sink);
        }

        let exit_code = match self.launch(script, action, sink, cancel, global).await {
            Ok(code) => code,
            Err(failure) => self.report_failure(script, failure, sink),
        };

        emit(sink, SEPARATOR);
        if exit_code == 0 {
            emit(sink, "  [+] SUCCESS - Operation completed");
            info!("Script finished successfully: {}", script.display());
        } else {
            emit(sink, &format!("  [!] Finished with warnings (code: {exit_code})"));
            warn!(
                "Script finished with exit code {exit_code}: {}",
                script.display()
            );
        }
        emit(sink, SEPARATOR);

        exit_code
    }

    async fn launch(
        &self,
        script: &Path,
        action: Option<&str>,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
        global: &CancellationToken,
    ) -> Result<i32, RunFailure> {
        if let Some(forwarded) = self.launcher.forwarded_action(script, action) {
            emit(sink, &format!("[>] Action: {forwarded}"));
        }

        // Narrows, but cannot close, the race with a concurrent cancel_all.
        if cancel.is_cancelled() || global.is_cancelled() {
            return Err(RunFailure::Cancelled);
        }

        let mut child = self
            .launcher
            .command(script, action)
            .spawn()
            .map_err(RunFailure::Spawn)?;

        let key = self.registry.next_key(script);
        if let Some(pid) = child.id() {
            debug!("Spawned {key} as pid {pid}");
            self.registry.insert(key.clone(), pid);
        }

        let result = self.supervise(&mut child, sink, cancel, global).await;
        self.registry.remove(&key);
        result
    }

    /// Streams output until both pipes close, then waits for the exit
    /// status. Cancellation at any point, or the timeout during the exit
    /// wait, kills the whole process tree.
    async fn supervise(
        &self,
        child: &mut Child,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
        global: &CancellationToken,
    ) -> Result<i32, RunFailure> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let drained = tokio::select! {
            _ = async { tokio::join!(drain(stdout, sink), drain(stderr, sink)) } => true,
            _ = interrupted(cancel, global) => false,
        };
        if !drained {
            terminate(child).await;
            return Err(RunFailure::Cancelled);
        }

        let waited = tokio::time::timeout(self.timeout, async {
            tokio::select! {
                status = child.wait() => Some(status),
                _ = interrupted(cancel, global) => None,
            }
        })
        .await;

        match waited {
            Ok(Some(Ok(status))) => Ok(exit_code_of(status)),
            Ok(Some(Err(e))) => {
                terminate(child).await;
                Err(RunFailure::Wait(e))
            }
            Ok(None) => {
                terminate(child).await;
                Err(RunFailure::Cancelled)
            }
            Err(_elapsed) => {
                terminate(child).await;
                Err(RunFailure::Timeout)
            }
        }
    }

    fn report_failure(
        &self,
        script: &Path,
        failure: RunFailure,
        sink: Option<&dyn OutputSink>,
    ) -> i32 {
        match failure {
            RunFailure::Integrity { expected, actual } => {
                emit(
                    sink,
                    "ERROR: Script integrity check failed - file was modified between validation and execution",
                );
                error!(
                    "Script hash mismatch for {}: expected={expected:?}, got={actual:?}",
                    script.display()
                );
            }
            RunFailure::Spawn(e) => {
                emit(sink, &format!("ERROR: Failed to start script process: {e}"));
                emit(
                    sink,
                    "This may be due to insufficient permissions or PowerShell not being available.",
                );
                error!(
                    "Failed to start script process {} via {}: {e}",
                    script.display(),
                    self.launcher.program().display()
                );
            }
            RunFailure::Wait(e) => {
                emit(sink, &format!("ERROR: Lost track of script process: {e}"));
                error!("Waiting on {} failed: {e}", script.display());
            }
            RunFailure::Timeout => {
                emit(
                    sink,
                    &format!(
                        "[!] Script did not exit within {}s and was terminated",
                        self.timeout.as_secs()
                    ),
                );
                warn!(
                    "Process did not terminate within {:?}, forced: {}",
                    self.timeout,
                    script.display()
                );
            }
            RunFailure::Cancelled => {
                emit(sink, CANCELLED_NOTICE);
                info!("Script cancelled: {}", script.display());
            }
        }
        SENTINEL_EXIT_CODE
    }

    fn reject(
        &self,
        message: &str,
        script: &Path,
        action: Option<&str>,
        sink: Option<&dyn OutputSink>,
    ) -> i32 {
        emit(sink, &format!("Error: {message}"));
        warn!("{message}");
        self.record(&script_name(script), action, SENTINEL_EXIT_CODE, 0);
        SENTINEL_EXIT_CODE
    }

    fn record(&self, script_name: &str, action: Option<&str>, exit_code: i32, duration_ms: u64) {
        self.telemetry.record(&ActionTelemetry::new(
            script_name,
            action,
            exit_code,
            duration_ms,
        ));
    }
}

#[async_trait]
impl ScriptRunner for ScriptGateway {
    async fn run_script(&self, request: ExecutionRequest) -> i32 {
        self.run(request).await
    }
}

/// Re-hashes the script right before spawn. A missing hash on either side
/// counts as tampering.
async fn verify_integrity(script: &Path, expected: Option<String>) -> Result<(), RunFailure> {
    let actual = integrity::compute_hash(script).await;
    if expected.is_some() && expected == actual {
        Ok(())
    } else {
        Err(RunFailure::Integrity { expected, actual })
    }
}

fn emit(sink: Option<&dyn OutputSink>, line: &str) {
    if let Some(sink) = sink {
        sink.line(line);
    }
}

fn script_name(script: &Path) -> String {
    script
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.display().to_string())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Signal-killed processes have no code and map to the sentinel.
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SENTINEL_EXIT_CODE)
}

async fn interrupted(cancel: &CancellationToken, global: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = global.cancelled() => {}
    }
}

/// Forwards each line to the sink as soon as it arrives. Invalid UTF-8 is
/// replaced rather than dropped.
async fn drain<R: AsyncRead + Unpin>(stream: Option<R>, sink: Option<&dyn OutputSink>) {
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line: Cow<'_, str> = String::from_utf8_lossy(&buf);
                emit(sink, line.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                debug!("Output stream read failed: {e}");
                break;
            }
        }
    }
}

/// Best-effort kill of the child's tree, then reap it.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_tree(pid);
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {e}");
    }
    if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        warn!("Killed process was not reaped within {REAP_TIMEOUT:?}");
    }
}
