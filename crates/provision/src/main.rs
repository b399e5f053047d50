use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use appliance_config::ApplianceConfig;
use clap::{Parser, Subcommand};

use appliance_provision::console::Console;
use appliance_provision::continuation::{shell_quote, StateStore};
use appliance_provision::controller::{Invocation, Orchestrator, RunOutcome};
use appliance_provision::environment::{Environment, Privilege};
use appliance_provision::error::ProvisionError;
use appliance_provision::exec::SystemRunner;
use appliance_provision::{logging, os_release};

#[derive(Parser)]
#[command(name = "appliance-provision")]
#[command(about = "Provision this board as an appliance; resumes itself across reboots")]
struct Cli {
    /// Path to appliance.toml [default: <root>/appliance.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Install root holding resources/, venv/, data/ and logs/
    /// [default: directory of this executable]
    #[arg(long)]
    root: Option<PathBuf>,

    /// Resume after a reboot (used by the login hook)
    #[arg(long = "continue")]
    resume: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Provision (default)
    Run,
    /// Show whether a continuation is pending
    Status,
    /// Drop a pending continuation and restore normal login
    Reset,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("appliance-provision: {e:#}");
            let code = e
                .downcast_ref::<ProvisionError>()
                .map(ProvisionError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    if cli.resume && !std::io::stdin().is_terminal() {
        return Err(ProvisionError::Usage("--continue needs an interactive terminal".into()).into());
    }

    let exe = std::env::current_exe().context("locating executable")?;
    let root = match cli.root {
        Some(root) => root,
        None => exe
            .parent()
            .map(Path::to_path_buf)
            .context("executable has no parent directory")?,
    };
    let env = Environment::resolve(&root)?;

    let config_path = cli
        .config
        .unwrap_or_else(|| env.install_root.join("appliance.toml"));
    let config_path = std::fs::canonicalize(&config_path).unwrap_or(config_path);
    let config = ApplianceConfig::load(&config_path)
        .map_err(ProvisionError::from)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let command = cli.command.unwrap_or(Command::Run);
    // A fresh run on the wrong OS exits before logs/ is created.
    if matches!(command, Command::Run)
        && !cli.resume
        && !StateStore::new(&env.state_file).exists()
    {
        os_release::gate(&env, &config.os)?;
    }

    let guard = match logging::init(&env.trace_log()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!(
                "appliance-provision: no trace log at {} ({e})",
                env.trace_log().display()
            );
            None
        }
    };
    let console = match Console::open(&env.install_log()) {
        Ok(console) => console,
        Err(e) => {
            eprintln!(
                "appliance-provision: no install log at {} ({e}); terminal only",
                env.install_log().display()
            );
            Console::terminal()
        }
    };
    let runner = SystemRunner::new(console.clone(), env.privilege == Privilege::Sudo);
    tracing::info!(
        root = %env.install_root.display(),
        user = %env.identity.user,
        privilege = ?env.privilege,
        as_root = env.started_as_root,
        "starting"
    );

    let mut orchestrator = Orchestrator::new(&config, &env, &runner, &console);
    match command {
        Command::Status => {
            println!("{}", orchestrator.status()?);
            Ok(0)
        }
        Command::Reset => {
            orchestrator.reset()?;
            Ok(0)
        }
        Command::Run => {
            let invocation = Invocation {
                resume: cli.resume,
                working_dir: env.install_root.clone(),
                command: format!(
                    "{} --root {} --config {} --continue",
                    shell_quote(&exe.display().to_string()),
                    shell_quote(&env.install_root.display().to_string()),
                    shell_quote(&config_path.display().to_string()),
                ),
            };
            match orchestrator.run(&invocation)? {
                RunOutcome::Reboot(ticket) => {
                    // Flush the trace log before the machine goes down.
                    drop(guard);
                    ticket.trigger(&runner, &console)?;
                    Ok(0)
                }
                outcome => Ok(outcome.exit_code()),
            }
        }
    }
}
