//! Purpose: Hold top-level CLI command dispatch for `ttlbuf`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Output envelopes and exit code semantics are owned by `main.rs` helpers.

use super::*;

use std::fs::File;
use std::io::BufReader;

use ttlbuf::api::InterruptFlag;

pub(super) fn dispatch_command(
    command: Command,
    device: &DeviceArgs,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "ttlbuf", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Run { file } => {
            let options = device.options()?;
            let interrupt = InterruptFlag::new();
            signal_hook::flag::register(signal_hook::consts::SIGINT, interrupt.shared())
                .map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to install SIGINT handler")
                        .with_source(err)
                })?;

            let mut input: Box<dyn io::BufRead> = match &file {
                Some(path) => {
                    let file = File::open(path).map_err(|err| {
                        Error::new(ErrorKind::Io)
                            .with_message(format!("failed to open script {}", path.display()))
                            .with_hint("Check the --file path.")
                            .with_source(err)
                    })?;
                    Box::new(BufReader::new(file))
                }
                None => Box::new(io::stdin().lock()),
            };
            let mut stdout = io::stdout().lock();
            let mut on_notice = |notice: &Notice| emit_notice(notice, color_mode);

            let summary = script::run_script(
                &mut input,
                options,
                interrupt,
                &mut stdout,
                &mut on_notice,
            )?;
            tracing::debug!(ops = summary.ops, failures = summary.failures, "script finished");
            Ok(match summary.first_failure {
                Some(kind) => RunOutcome::with_code(to_exit_code(kind)),
                None => RunOutcome::ok(),
            })
        }
        Command::Bench {
            writers,
            readers,
            region,
            rounds,
            format,
        } => {
            let region = parse_size(&region)?;
            let region = usize::try_from(region).map_err(|_| {
                Error::new(ErrorKind::Usage).with_message("--region is too large")
            })?;
            bench::run_bench(
                bench::BenchArgs {
                    writers,
                    readers,
                    region,
                    rounds,
                    format,
                },
                env!("CARGO_PKG_VERSION"),
            )?;
            Ok(RunOutcome::ok())
        }
    }
}
