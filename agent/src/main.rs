//! nodeprep CLI entrypoint.
//!
//! Loads and validates configuration, wires the production collaborators,
//! and runs the selected workflow. After a reboot request the process
//! stays alive until the host shuts it down.

use clap::Parser;
use nodeprep_agent::cli::Cli;
use nodeprep_agent::cluster::KubectlClient;
use nodeprep_agent::config::{AgentConfig, FileConfig};
use nodeprep_agent::download::UreqFetcher;
use nodeprep_agent::error::AgentError;
use nodeprep_agent::exec::SystemCommandExecutor;
use nodeprep_agent::logging;
use nodeprep_agent::orchestrator::{Collaborators, Orchestrator, Outcome};
use nodeprep_agent::service::Systemd;
use nodeprep_agent::signature::GpgvVerifier;
use nodeprep_agent::update_engine::UpdateEngineClient;
use std::error::Error;
use std::io::Write;
use std::time::Duration;

/// Poll interval while waiting for a requested reboot to take the process
/// down.
const REBOOT_WAIT_STEP: Duration = Duration::from_secs(60);

fn main() {
    let cli = Cli::parse();
    let mut stderr = std::io::stderr();
    if let Err(err) = logging::init(cli.verbosity, cli.log_file().as_deref()) {
        write_stderr_line(&mut stderr, format_args!("warning: logging disabled: {err}"));
    }

    let run_result = run(&cli);
    if let Err(err) = &run_result {
        log::error!("workflow failed: {err}");
    }
    let exit_code = exit_code_for_run_result(&run_result, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    if let Ok(outcome) = run_result {
        if outcome.reboot_requested {
            log::info!("reboot requested; waiting for shutdown");
            sleep_forever(REBOOT_WAIT_STEP);
        }
        if let Some(step) = cli.sleep_step() {
            log::info!("hook finished; sleeping");
            sleep_forever(step);
        }
    }
}

fn run(cli: &Cli) -> Result<Outcome, AgentError> {
    let file = cli
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?
        .unwrap_or_default();
    let config = AgentConfig::resolve(cli.workflow(), file, cli.overrides())?;
    log::debug!("resolved configuration: {config:?}");

    let executor = SystemCommandExecutor::with_timeout(config.command_timeout);
    let fetcher = UreqFetcher;
    let verifier = GpgvVerifier::new(&executor, &config.keyring);
    let update_engine = UpdateEngineClient::new(&executor, &config.update_engine_client);
    let cluster = KubectlClient::new(&executor, &config.kubectl, &config.kubeconfig);
    let services = Systemd::new(&executor, &config.paths.unit_dir);
    let deps = Collaborators {
        executor: &executor,
        fetcher: &fetcher,
        verifier: &verifier,
        update_engine: &update_engine,
        cluster: &cluster,
        services: &services,
    };

    Orchestrator::new(&config, deps).run()
}

fn sleep_forever(step: Duration) -> ! {
    loop {
        std::thread::sleep(step);
    }
}

fn exit_code_for_run_result(result: &Result<Outcome, AgentError>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => {
            write_error_chain(stderr, err);
            err.exit_code()
        }
    }
}

fn write_error_chain(stderr: &mut dyn Write, err: &AgentError) {
    write_stderr_line(stderr, format_args!("error: {err}"));
    let mut next = err.source();
    while let Some(cause) = next {
        write_stderr_line(stderr, format_args!("  caused by: {cause}"));
        next = cause.source();
    }
}

fn write_stderr_line(stderr: &mut dyn Write, message: impl std::fmt::Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort logging; ignore write failures.
    }
}
