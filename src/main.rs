//! Command line entry point.
//!
//! Subcommands map onto the host lifecycle: `setup` brings the host up and
//! issues its key material, `run` executes a command on it under supervision,
//! `cleanup` returns it to a clean state per the configured policy, and
//! `destroy` disposes of it.
//!
//! ## Exit codes for `run`
//!
//! | outcome          | exit code        |
//! |------------------|------------------|
//! | completed        | remote exit code |
//! | timed out        | 124              |
//! | aborted          | 125              |
//! | transport failed | 126              |
//!
//! 124 follows the GNU `timeout` convention; 125 and 126 are adjacent values
//! a remote build command does not normally produce.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use hostler::config::{self, MachineConfig};
use hostler::host::supervise::{ExecutionOutcome, RunRequest, supervise};
use hostler::host::{cleanup, keys, probe};
use hostler::output::{OutputFormat, StandardStreams};
use hostler::runner::{HostContext, ProcessRunner};

const EXIT_TIMED_OUT: u8 = 124;
const EXIT_ABORTED: u8 = 125;
const EXIT_TRANSPORT_FAILED: u8 = 126;

/// CI build-host lifecycle manager.
#[derive(Parser, Debug)]
#[command(name = "hostler", version, about = "CI build-host lifecycle manager")]
struct Cli {
    /// Working & config directory of the host.
    #[arg(long, env = "HOSTLER_WORKDIR")]
    workdir: PathBuf,

    /// Additional KEY=VALUE environment variables for external commands.
    #[arg(short = 'e', long = "environment")]
    environment: Vec<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create the host if needed and issue its SSH key material.
    Setup {
        /// Reissue key material even if it already exists.
        #[arg(long)]
        force: bool,
    },
    /// Destroy the host and remove its key material.
    Destroy,
    /// Return the host to a clean state per the configured cleanup policy.
    Cleanup {
        /// The host will be destroyed immediately afterwards by an external
        /// process: skip the policy action and only remove key material.
        #[arg(long)]
        will_be_destroyed: bool,
    },
    /// Run a command on the host under supervision.
    Run {
        /// The command to execute on the host.
        command: String,

        /// Timeout in seconds; 0 disables the timeout.
        #[arg(long, default_value_t = 0)]
        timeout: u64,

        /// URL polled periodically; when it reports the build as aborted,
        /// the run is canceled.
        #[arg(long)]
        abort_check_url: Option<String>,

        /// Output format for the executed command's output ("" or "json").
        #[arg(long, default_value = "")]
        logformat: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = hostler::logging::init(&cli.workdir);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(dispatch(cli));
    runtime.shutdown_timeout(Duration::from_secs(1));
    code
}

async fn dispatch(cli: Cli) -> ExitCode {
    match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_command(cli: Cli) -> Result<ExitCode> {
    let additional_envs =
        config::parse_env_items(&cli.environment).context("invalid --environment parameter")?;
    let config = MachineConfig::load(&cli.workdir)?;
    let ctx = HostContext::new(&cli.workdir).with_envs(config.merged_envs(&additional_envs));
    let runner = ProcessRunner;

    match cli.command {
        Cmd::Setup { force } => {
            setup(&runner, &ctx, &config, force).await?;
            info!("setup done");
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Destroy => {
            destroy(&runner, &ctx).await?;
            info!("destroy done");
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Cleanup { will_be_destroyed } => {
            let policy = config.cleanup_policy()?;
            cleanup::run_cleanup(&runner, &ctx, &policy, will_be_destroyed).await?;
            info!("cleanup done");
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Run {
            command,
            timeout,
            abort_check_url,
            logformat,
        } => {
            if let Some(raw) = &abort_check_url {
                url::Url::parse(raw).context("invalid --abort-check-url")?;
            }
            let format: OutputFormat = logformat.parse()?;
            let request = RunRequest {
                command: command.clone(),
                timeout: Duration::from_secs(timeout),
                abort_check_url,
                format,
            };
            let transport = config.ssh.transport_command(&cli.workdir, &command);
            let mut sink = StandardStreams::new(format);
            let outcome = supervise(transport, &request, &mut sink).await;
            Ok(exit_code_for(outcome))
        }
    }
}

/// Bring the host up and make sure its key material exists.
///
/// Honours `is_cleanup_before_setup` from the config: a cleanup pass runs
/// first so a recycled working directory starts from a clean host.
async fn setup(
    runner: &ProcessRunner,
    ctx: &HostContext,
    config: &MachineConfig,
    force: bool,
) -> Result<()> {
    if config.is_cleanup_before_setup {
        let policy = config.cleanup_policy()?;
        info!(policy = policy.name(), "running cleanup before setup");
        cleanup::run_cleanup(runner, ctx, &policy, false).await?;
    }

    let state = probe::probe_host_state(runner, ctx).await?;
    if state.exists() {
        info!(state = state.as_str(), "host already created");
    } else {
        info!("creating host");
        cleanup::create_host(runner, ctx).await?;
        info!("host created and ready");
    }

    keys::ensure_keypair(runner, ctx, force).await?;
    Ok(())
}

async fn destroy(runner: &ProcessRunner, ctx: &HostContext) -> Result<()> {
    let state = probe::probe_host_state(runner, ctx).await?;
    if state.exists() {
        info!(state = state.as_str(), "destroying host");
        cleanup::destroy_host(runner, ctx).await?;
        info!("host destroyed");
    } else {
        info!("host is not created, nothing to destroy");
    }
    keys::delete_key_files(&ctx.workdir)?;
    Ok(())
}

fn exit_code_for(outcome: ExecutionOutcome) -> ExitCode {
    match outcome {
        ExecutionOutcome::Completed { exit_code } => {
            info!(exit_code, "remote command completed");
            ExitCode::from(exit_code.clamp(0, 255) as u8)
        }
        ExecutionOutcome::TimedOut => {
            warn!("run timed out");
            ExitCode::from(EXIT_TIMED_OUT)
        }
        ExecutionOutcome::Aborted => {
            warn!("run aborted by external signal");
            ExitCode::from(EXIT_ABORTED)
        }
        ExecutionOutcome::TransportFailed { error } => {
            error!("transport failed: {error}");
            ExitCode::from(EXIT_TRANSPORT_FAILED)
        }
    }
}
