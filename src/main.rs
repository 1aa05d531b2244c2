mod config;
mod gateway;
mod prompt;
mod restore;
mod risk;
mod telemetry;
mod update;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::gateway::{ExecutionRequest, OutputSink, ScriptGateway, SENTINEL_EXIT_CODE};
use crate::prompt::TerminalPresenter;
use crate::restore::{DialogPresenter, RestoreGate, RESTORE_SCRIPT};
use crate::telemetry::TracingTelemetry;
use crate::update::UpdateChecker;

fn print_help() {
    println!(
        "\
tweak-gate v{}

Runs a system tweak script through the privileged execution gateway:
path and action validation, integrity check, restore point prompt and
confirmation for destructive actions, bounded concurrency, timeout.

USAGE:
    tweak-gate [OPTIONS] <SCRIPT> [ACTION]

ARGUMENTS:
    SCRIPT    Path to a .ps1 script inside the scripts directory
    ACTION    Action id forwarded to parameterized scripts (e.g. gamebar-off)

OPTIONS:
    -c, --config <PATH>    TOML configuration file [default: built-in defaults]
    -n, --name <NAME>      Display name used in warnings [default: ACTION]
    -y, --yes              Assume \"yes\" for every confirmation prompt
        --skip-restore     Do not offer a restore point this session
        --check-update     Check for a newer release and exit
        --dismiss <VER>    Stop announcing release VER and exit
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG      Log level filter for tracing
                  (e.g. debug, tweak_gate=debug,telemetry=warn)
    SystemRoot    Windows directory used to locate powershell.exe

EXAMPLES:
    tweak-gate scripts/cleanup.ps1
    tweak-gate -c config/gateway.toml scripts/privacy.ps1 telemetry-disable
    RUST_LOG=debug tweak-gate --check-update",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line for a run.
#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config: Option<String>,
    name: Option<String>,
    assume_yes: bool,
    skip_restore: bool,
    check_update: bool,
    dismiss: Option<String>,
    script: Option<PathBuf>,
    action: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Help,
    Version,
    Run(CliArgs),
}

fn parse_args<I>(args: I) -> Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliCommand::Help),
            "--version" | "-V" => return Ok(CliCommand::Version),
            "--config" | "-c" => parsed.config = Some(value(&arg)?),
            "--name" | "-n" => parsed.name = Some(value(&arg)?),
            "--dismiss" => parsed.dismiss = Some(value(&arg)?),
            "--yes" | "-y" => parsed.assume_yes = true,
            "--skip-restore" => parsed.skip_restore = true,
            "--check-update" => parsed.check_update = true,
            flag if flag.starts_with('-') && flag.len() > 1 => bail!("Unknown option: {flag}"),
            _ if parsed.script.is_none() => parsed.script = Some(PathBuf::from(arg)),
            _ if parsed.action.is_none() => parsed.action = Some(arg),
            _ => bail!("Unexpected argument: {arg}"),
        }
    }

    Ok(CliCommand::Run(parsed))
}

/// The sentinel has no meaning to a shell; report it as a plain failure.
fn process_exit_code(exit_code: i32) -> i32 {
    if exit_code == SENTINEL_EXIT_CODE {
        1
    } else {
        exit_code
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1))? {
        CliCommand::Help => {
            print_help();
            return Ok(());
        }
        CliCommand::Version => {
            println!("tweak-gate v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliCommand::Run(args) => args,
    };

    // Logs go to stderr; stdout carries script output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tweak_gate=info,telemetry=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None => Config::default(),
    };

    if args.check_update || args.dismiss.is_some() {
        return update_command(&config, &args).await;
    }

    let Some(script) = args.script.clone() else {
        print_help();
        bail!("Missing <SCRIPT> argument");
    };

    let exit_code = run(&config, &args, &script).await?;
    std::process::exit(process_exit_code(exit_code));
}

async fn run(config: &Config, args: &CliArgs, script: &Path) -> Result<i32> {
    let gateway = Arc::new(ScriptGateway::from_config(
        config,
        Arc::new(TracingTelemetry),
    ));

    let scripts_dir = match &config.gateway.scripts_dir {
        Some(dir) => dir.clone(),
        None => script
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let scripts_dir = std::path::absolute(&scripts_dir)?;
    gateway.set_base_directory(&scripts_dir)?;

    if !gateway.interpreter_available() {
        warn!("Interpreter not found, scripts will fail to start");
    }

    let presenter: Arc<dyn DialogPresenter> =
        Arc::new(TerminalPresenter::new(args.assume_yes, args.skip_restore));
    let sink: Arc<dyn OutputSink> = Arc::new(|line: &str| println!("{line}"));
    let cancel = CancellationToken::new();
    let gate = RestoreGate::new(presenter.clone(), gateway.clone());

    if let Some(action) = args.action.as_deref() {
        let display_name = args.name.as_deref().unwrap_or(action);
        if let Some(confirmation) = risk::confirmation(action, display_name) {
            let proceed = gate
                .ensure(&scripts_dir, Some(sink.clone()), cancel.clone())
                .await
                && presenter.confirm(&confirmation).await;
            if !proceed {
                println!("Cancelled, nothing was changed.");
                info!("User declined {action}");
                gateway.shutdown();
                return Ok(SENTINEL_EXIT_CODE);
            }
        }
    }

    let mut request = ExecutionRequest::new(script)
        .with_sink(sink)
        .with_cancel(cancel);
    if let Some(action) = &args.action {
        request = request.with_action(action.clone());
    }
    let mut task = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.run(request).await }
    });

    let joined = await_run(&mut task, tokio::signal::ctrl_c, &gateway, presenter.as_ref()).await;

    let exit_code = match joined {
        Ok(exit_code) => exit_code,
        Err(e) => {
            error!("Script task failed: {e}");
            SENTINEL_EXIT_CODE
        }
    };
    if gateway.is_cancellation_requested() {
        info!("Run ended by cancellation");
    }
    if exit_code == 0 && is_restore_script(script) {
        gate.mark_created();
        info!("Restore point created manually");
    }

    gateway.shutdown();
    Ok(exit_code)
}

/// Waits for the spawned run, offering to cancel on every interrupt. The
/// cancel prompt races the run, so a run that ends while the question is
/// open is returned immediately.
async fn await_run<F, Fut>(
    task: &mut JoinHandle<i32>,
    mut interrupted: F,
    gateway: &ScriptGateway,
    presenter: &dyn DialogPresenter,
) -> Result<i32, JoinError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    loop {
        tokio::select! {
            joined = &mut *task => return joined,
            signal = interrupted() => {
                if let Err(e) = signal {
                    warn!("Cannot listen for Ctrl-C: {e}");
                    return (&mut *task).await;
                }
                info!(
                    "Interrupt received with {} running script(s)",
                    gateway.active_operations()
                );
                // Nothing spawned yet: no need to ask
                if !gateway.has_active_operations() {
                    gateway.cancel_all();
                    continue;
                }
                let confirmed = tokio::select! {
                    joined = &mut *task => return joined,
                    confirmed = presenter.confirm_cancel() => confirmed,
                };
                if confirmed {
                    gateway.cancel_all();
                }
            }
        }
    }
}

fn is_restore_script(script: &Path) -> bool {
    script
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.eq_ignore_ascii_case(RESTORE_SCRIPT))
}

async fn update_command(config: &Config, args: &CliArgs) -> Result<()> {
    let checker = UpdateChecker::new(&config.update);

    if let Some(version) = &args.dismiss {
        checker.dismiss(version);
        println!("Version {version} will no longer be announced");
        return Ok(());
    }

    if !config.update.enabled {
        println!("Update checks are disabled in the configuration");
        return Ok(());
    }

    match checker.check().await {
        Some(update) => println!("Version {} is available: {}", update.version, update.url),
        None => println!("tweak-gate v{} is up to date", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}
