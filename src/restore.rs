//! Once-per-session restore point precondition.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gateway::{ExecutionRequest, OutputSink, ScriptRunner};
use crate::risk::Confirmation;

/// Script that creates the restore point, looked up in the scripts
/// directory.
pub const RESTORE_SCRIPT: &str = "create_restore_point.ps1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreDecision {
    Unknown,
    Created,
    Skipped,
}

/// What the user picked when offered a restore point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreChoice {
    Create,
    Skip,
    Cancel,
}

/// User-facing questions asked by the gate and the CLI.
#[async_trait]
pub trait DialogPresenter: Send + Sync {
    async fn restore_point_prompt(&self) -> RestoreChoice;

    /// Asks the user to go ahead with a destructive action.
    async fn confirm(&self, confirmation: &Confirmation) -> bool;

    /// Asks whether running operations should be cancelled.
    async fn confirm_cancel(&self) -> bool;
}

/// Tri-state gate: `Unknown` until the user either skips or a restore
/// point is created successfully, after which every `ensure` passes.
pub struct RestoreGate {
    presenter: Arc<dyn DialogPresenter>,
    runner: Arc<dyn ScriptRunner>,
    state: Mutex<RestoreDecision>,
}

impl RestoreGate {
    pub fn new(presenter: Arc<dyn DialogPresenter>, runner: Arc<dyn ScriptRunner>) -> Self {
        Self {
            presenter,
            runner,
            state: Mutex::new(RestoreDecision::Unknown),
        }
    }

    pub fn state(&self) -> RestoreDecision {
        *self.lock()
    }

    /// Forces the state to `Created`, for restore points made outside
    /// the gated path.
    pub fn mark_created(&self) {
        *self.lock() = RestoreDecision::Created;
    }

    /// Returns false only when the user cancelled; the pending action must
    /// then be abandoned. A failed restore point still returns true and
    /// leaves the state at `Unknown` so the next action asks again.
    pub async fn ensure(
        &self,
        script_dir: &Path,
        sink: Option<Arc<dyn OutputSink>>,
        cancel: CancellationToken,
    ) -> bool {
        if self.state() != RestoreDecision::Unknown {
            return true;
        }

        match self.presenter.restore_point_prompt().await {
            RestoreChoice::Cancel => {
                info!("User cancelled at the restore point prompt");
                false
            }
            RestoreChoice::Skip => {
                info!("User skipped restore point creation");
                self.transition(RestoreDecision::Skipped);
                true
            }
            RestoreChoice::Create => {
                let mut request =
                    ExecutionRequest::new(script_dir.join(RESTORE_SCRIPT)).with_cancel(cancel);
                if let Some(sink) = sink {
                    request = request.with_sink(sink);
                }
                let exit_code = self.runner.run_script(request).await;
                if exit_code == 0 {
                    info!("Restore point created");
                    self.transition(RestoreDecision::Created);
                } else {
                    warn!("Restore point creation failed (exit code {exit_code}), will ask again");
                }
                true
            }
        }
    }

    /// Moves out of `Unknown` only; a concurrent `mark_created` wins.
    fn transition(&self, to: RestoreDecision) {
        let mut state = self.lock();
        if *state == RestoreDecision::Unknown {
            *state = to;
        }
    }

    fn lock(&self) -> MutexGuard<'_, RestoreDecision> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePresenter {
        choice: RestoreChoice,
        prompts: AtomicUsize,
    }

    impl FakePresenter {
        fn new(choice: RestoreChoice) -> Arc<Self> {
            Arc::new(Self {
                choice,
                prompts: AtomicUsize::new(0),
            })
        }

        fn prompts(&self) -> usize {
            self.prompts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DialogPresenter for FakePresenter {
        async fn restore_point_prompt(&self) -> RestoreChoice {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            self.choice
        }

        async fn confirm(&self, _confirmation: &Confirmation) -> bool {
            true
        }

        async fn confirm_cancel(&self) -> bool {
            true
        }
    }

    struct FakeRunner {
        exit_code: i32,
        scripts: Mutex<Vec<PathBuf>>,
    }

    impl FakeRunner {
        fn new(exit_code: i32) -> Arc<Self> {
            Arc::new(Self {
                exit_code,
                scripts: Mutex::new(Vec::new()),
            })
        }

        fn scripts(&self) -> Vec<PathBuf> {
            self.scripts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScriptRunner for FakeRunner {
        async fn run_script(&self, request: ExecutionRequest) -> i32 {
            self.scripts.lock().unwrap().push(request.script_path);
            self.exit_code
        }
    }

    async fn ensure(gate: &RestoreGate) -> bool {
        gate.ensure(Path::new("/opt/scripts"), None, CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_skip_is_remembered() {
        let presenter = FakePresenter::new(RestoreChoice::Skip);
        let runner = FakeRunner::new(0);
        let gate = RestoreGate::new(presenter.clone(), runner.clone());

        assert!(ensure(&gate).await);
        assert_eq!(gate.state(), RestoreDecision::Skipped);
        assert!(ensure(&gate).await);
        assert_eq!(presenter.prompts(), 1);
        assert!(runner.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_successful_create() {
        let presenter = FakePresenter::new(RestoreChoice::Create);
        let runner = FakeRunner::new(0);
        let gate = RestoreGate::new(presenter.clone(), runner.clone());

        assert!(ensure(&gate).await);
        assert_eq!(gate.state(), RestoreDecision::Created);
        assert_eq!(
            runner.scripts(),
            vec![PathBuf::from("/opt/scripts").join(RESTORE_SCRIPT)]
        );

        assert!(ensure(&gate).await);
        assert_eq!(presenter.prompts(), 1);
    }

    #[tokio::test]
    async fn test_failed_create_reprompts() {
        let presenter = FakePresenter::new(RestoreChoice::Create);
        let runner = FakeRunner::new(1);
        let gate = RestoreGate::new(presenter.clone(), runner.clone());

        assert!(ensure(&gate).await);
        assert_eq!(gate.state(), RestoreDecision::Unknown);
        assert!(ensure(&gate).await);
        assert_eq!(presenter.prompts(), 2);
        assert_eq!(runner.scripts().len(), 2);
    }

    #[tokio::test]
    async fn test_sentinel_exit_counts_as_failure() {
        let gate = RestoreGate::new(
            FakePresenter::new(RestoreChoice::Create),
            FakeRunner::new(-1),
        );
        assert!(ensure(&gate).await);
        assert_eq!(gate.state(), RestoreDecision::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_blocks_action() {
        let presenter = FakePresenter::new(RestoreChoice::Cancel);
        let gate = RestoreGate::new(presenter.clone(), FakeRunner::new(0));

        assert!(!ensure(&gate).await);
        assert_eq!(gate.state(), RestoreDecision::Unknown);
        assert!(!ensure(&gate).await);
        assert_eq!(presenter.prompts(), 2);
    }

    #[tokio::test]
    async fn test_mark_created_skips_prompt() {
        let presenter = FakePresenter::new(RestoreChoice::Cancel);
        let gate = RestoreGate::new(presenter.clone(), FakeRunner::new(0));

        gate.mark_created();
        assert_eq!(gate.state(), RestoreDecision::Created);
        assert!(ensure(&gate).await);
        assert_eq!(presenter.prompts(), 0);
    }
}
