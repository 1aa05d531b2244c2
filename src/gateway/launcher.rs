//! Interpreter resolution and argument construction.
//!
//! The interpreter binary, its fixed flags and the environment handed to
//! scripts are configuration; this module turns them into a ready
//! [`Command`]. Arguments are passed as a vector, never through a shell
//! line, and the only caller-controlled values (script path and action id)
//! have already been validated by [`super::guard`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::warn;

use crate::config::InterpreterConfig;

/// Scripts that dispatch on an `-Action <id>` argument (file name,
/// case-insensitive).
pub const PARAMETERIZED_SCRIPTS: &[&str] = &[
    "gaming-optimizations.ps1",
    "network-optimizations.ps1",
    "general-tweaks.ps1",
    "services-management.ps1",
    "revert-privacy.ps1",
    "privacy.ps1",
    "security.ps1",
    "revert-security.ps1",
];

/// Tells scripts they are driven by the gateway rather than run by hand.
pub const EMBEDDED_ENV: &str = "PTW_EMBEDDED";
/// Where scripts should write their own log files.
pub const LOG_DIR_ENV: &str = "PTW_LOG_DIR";

const FALLBACK_SYSTEM_ROOT: &str = "C:\\Windows";
const POWERSHELL_SUBPATH: &str = "System32\\WindowsPowerShell\\v1.0\\powershell.exe";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Resolves the PowerShell binary from a `SystemRoot`-style value.
///
/// The root must be a drive path made of `[A-Za-z0-9\:]` only; anything
/// else (missing, empty, odd characters, relative) falls back to
/// `C:\Windows`.
pub fn resolve_interpreter(system_root: Option<&str>) -> PathBuf {
    let root = system_root
        .map(str::trim)
        .filter(|root| is_safe_system_root(root))
        .unwrap_or(FALLBACK_SYSTEM_ROOT)
        .trim_end_matches('\\');
    PathBuf::from(format!("{root}\\{POWERSHELL_SUBPATH}"))
}

fn is_safe_system_root(root: &str) -> bool {
    let charset_ok = root
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'\\' || b == b':');
    charset_ok
        && matches!(root.as_bytes(), [drive, b':', b'\\', ..] if drive.is_ascii_alphabetic())
}

/// True when the script's file name is on the parameterized allow-list.
pub fn is_parameterized(script: &Path) -> bool {
    script
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| {
            PARAMETERIZED_SCRIPTS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(name))
        })
}

/// Builds interpreter invocations for validated scripts.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<String>,
    log_dir: PathBuf,
}

impl Launcher {
    pub fn new(program: PathBuf, args: Vec<String>, log_dir: PathBuf) -> Self {
        Self {
            program,
            args,
            log_dir,
        }
    }

    /// Builds a launcher from config. An explicit `program` must be an
    /// absolute path; otherwise the `SystemRoot` resolution is used.
    pub fn from_config(interpreter: &InterpreterConfig, log_dir: &Path) -> Self {
        let resolved = || resolve_interpreter(std::env::var("SystemRoot").ok().as_deref());
        let program = match &interpreter.program {
            Some(program) if program.is_absolute() => program.clone(),
            Some(program) => {
                warn!(
                    "Ignoring non-absolute interpreter path {}, using default",
                    program.display()
                );
                resolved()
            }
            None => resolved(),
        };
        let log_dir = std::path::absolute(log_dir).unwrap_or_else(|_| log_dir.to_path_buf());

        Self::new(program, interpreter.args.clone(), log_dir)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether the interpreter binary exists on this machine.
    pub fn is_available(&self) -> bool {
        self.program.is_file()
    }

    /// The action actually forwarded to the script: only parameterized
    /// scripts receive one.
    pub fn forwarded_action<'a>(&self, script: &Path, action: Option<&'a str>) -> Option<&'a str> {
        action.filter(|_| is_parameterized(script))
    }

    /// Fixed prefix, then the script path, then `-Action <id>` when
    /// forwarded.
    pub fn arguments(&self, script: &Path, action: Option<&str>) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.push(script.as_os_str().to_owned());
        if let Some(action) = self.forwarded_action(script, action) {
            args.push("-Action".into());
            args.push(action.into());
        }
        args
    }

    /// Command with piped output, null stdin and its own process group so
    /// the whole tree can be killed.
    pub fn command(&self, script: &Path, action: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.arguments(script, action))
            .env(EMBEDDED_ENV, "1")
            .env(LOG_DIR_ENV, &self.log_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }
}
