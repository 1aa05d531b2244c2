//! Per-invocation outcome records.

use std::fmt;

use tracing::{info, warn};

/// Label used when a script ran without an action id.
pub const NO_ACTION_LABEL: &str = "Menu";

/// Outcome of one `run` call, including rejected ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTelemetry {
    pub script_name: String,
    pub action_label: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ActionTelemetry {
    pub fn new(script_name: &str, action: Option<&str>, exit_code: i32, duration_ms: u64) -> Self {
        let action_label = match action {
            Some(action) if !action.trim().is_empty() => action.to_string(),
            _ => NO_ACTION_LABEL.to_string(),
        };
        Self {
            script_name: script_name.to_string(),
            action_label,
            exit_code,
            duration_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for ActionTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ActionTelemetry script={} action={} exit={} duration={}ms",
            self.script_name, self.action_label, self.exit_code, self.duration_ms
        )
    }
}

/// Sink for invocation outcomes. Called exactly once per `run`.
pub trait TelemetryRecorder: Send + Sync {
    fn record(&self, record: &ActionTelemetry);
}

/// Routes records to the `telemetry` tracing target: `info` on success,
/// `warn` otherwise.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetryRecorder for TracingTelemetry {
    fn record(&self, record: &ActionTelemetry) {
        if record.succeeded() {
            info!(target: "telemetry", "{record}");
        } else {
            warn!(target: "telemetry", "{record}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_falls_back_to_menu() {
        assert_eq!(ActionTelemetry::new("a.ps1", None, 0, 1).action_label, "Menu");
        assert_eq!(ActionTelemetry::new("a.ps1", Some("  "), 0, 1).action_label, "Menu");
        assert_eq!(
            ActionTelemetry::new("a.ps1", Some("gamebar-off"), 0, 1).action_label,
            "gamebar-off"
        );
    }

    #[test]
    fn test_display_format() {
        let record = ActionTelemetry::new("privacy.ps1", Some("telemetry-disable"), -1, 0);
        assert_eq!(
            record.to_string(),
            "ActionTelemetry script=privacy.ps1 action=telemetry-disable exit=-1 duration=0ms"
        );
        assert!(!record.succeeded());
    }

    #[test]
    fn test_tracing_recorder_accepts_both_channels() {
        let recorder = TracingTelemetry;
        recorder.record(&ActionTelemetry::new("ok.ps1", None, 0, 12));
        recorder.record(&ActionTelemetry::new("bad.ps1", None, 3, 12));
    }
}
