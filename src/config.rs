use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base directory every script must live under.
    /// Supports ${ENV_VAR} substitution
    pub scripts_dir: Option<PathBuf>,
    /// Maximum number of scripts with a live process at once
    pub max_concurrency: usize,
    /// How long to wait for a script to exit once its output has closed
    pub timeout_secs: u64,
    /// Delay before a fresh cancellation token replaces a tripped one
    pub cancel_grace_ms: u64,
    /// Exported to scripts as PTW_LOG_DIR
    pub log_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scripts_dir: None,
            max_concurrency: 4,
            timeout_secs: 30,
            cancel_grace_ms: 500,
            log_dir: PathBuf::from("./logs"),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Absolute interpreter path. When unset, PowerShell is resolved
    /// from %SystemRoot%.
    pub program: Option<PathBuf>,
    /// Flags placed before the script path
    pub args: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_interpreter_args(),
        }
    }
}

pub fn default_interpreter_args() -> Vec<String> {
    [
        "-NoProfile",
        "-ExecutionPolicy",
        "Bypass",
        "-WindowStyle",
        "Hidden",
        "-File",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UpdateConfig {
    pub enabled: bool,
    pub releases_url: String,
    /// File holding the `dismissed_version=` marker
    pub prefs_path: PathBuf,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            releases_url:
                "https://api.github.com/repos/26zl/PleaseTweakWindows/releases/latest".to_string(),
            prefs_path: PathBuf::from("./logs/ptw-update-prefs.properties"),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SCRIPTS_DIR}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.gateway.max_concurrency == 0 {
            anyhow::bail!("gateway.max_concurrency must be at least 1");
        }
        if self.gateway.timeout_secs == 0 {
            anyhow::bail!("gateway.timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.gateway.max_concurrency, 4);
        assert_eq!(config.gateway.timeout(), Duration::from_secs(30));
        assert_eq!(config.gateway.cancel_grace(), Duration::from_millis(500));
        assert!(config.gateway.scripts_dir.is_none());
        assert!(config.interpreter.program.is_none());
        assert_eq!(config.interpreter.args, default_interpreter_args());
        assert!(config.update.enabled);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [gateway]
            scripts_dir = "/opt/ptw/scripts"
            max_concurrency = 2

            [interpreter]
            program = "/usr/bin/pwsh"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.gateway.scripts_dir.as_deref(),
            Some(std::path::Path::new("/opt/ptw/scripts"))
        );
        assert_eq!(config.gateway.max_concurrency, 2);
        assert_eq!(config.gateway.timeout_secs, 30);
        assert_eq!(config.interpreter.args, default_interpreter_args());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("TWEAK_GATE_TEST_SCRIPTS", "/srv/scripts");
        let config = Config::parse(
            r#"
            [gateway]
            scripts_dir = "${TWEAK_GATE_TEST_SCRIPTS}"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.gateway.scripts_dir.as_deref(),
            Some(std::path::Path::new("/srv/scripts"))
        );
    }

    #[test]
    fn test_missing_env_var_is_error() {
        let result = Config::parse(
            r#"
            [gateway]
            scripts_dir = "${TWEAK_GATE_SURELY_UNSET_VAR}"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = Config::parse("[gateway]\nmax_concurrency = 0\n");
        assert!(result.unwrap_err().to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_custom_interpreter_args() {
        let config = Config::parse("[interpreter]\nargs = []\n").unwrap();
        assert!(config.interpreter.args.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/tweak-gate.toml").is_err());
    }
}
