//! Purpose: `ttlbuf` CLI entry point: parses args, builds one device, runs a command against it.
//! Role: Binary crate root; plays the registration layer that opens sessions on the buffer.
//! Invariants: Script ops emit one JSON line each on stdout; errors and notices go to stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All buffer access goes through `api::Session`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod bench;
mod command_dispatch;
mod script;

use ttlbuf::api::{DeviceOptions, Error, ErrorKind, OpenPolicy, to_errno, to_exit_code};
use ttlbuf::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `ttlbuf --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command, &cli.device, color_mode)
        .map_err(add_interrupted_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "ttlbuf",
    version,
    about = "Shared byte buffer that clears itself after a period of inactivity",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"One buffer, many sessions. Each session has its own cursor.

Mental model:
  - `write` lands bytes at the session cursor and restarts the idle timer
  - `read` returns valid bytes only; past the end it returns nothing
  - after --ttl with no writes, the buffer is cleared in the background
"#,
    after_help = r#"EXAMPLES
  $ printf 'open a\nwrite a HELLO\nseek a set 0\nread a 16\n' | ttlbuf run
  $ ttlbuf --capacity 16 --ttl 1s run -f script.txt
  $ ttlbuf bench --writers 8

LEARN MORE
  $ ttlbuf <command> --help
  RUST_LOG=debug shows per-operation traces on stderr."#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[command(flatten)]
    device: DeviceArgs,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Debug)]
struct DeviceArgs {
    #[arg(
        long,
        global = true,
        default_value = "4K",
        help = "Buffer capacity in bytes (K/M/G suffixes allowed)"
    )]
    capacity: String,
    #[arg(
        long,
        global = true,
        default_value = "10s",
        help = "Idle time before the buffer is cleared (ms|s|m|h)"
    )]
    ttl: String,
    #[arg(long, global = true, help = "Allow only one open session at a time")]
    exclusive: bool,
    #[arg(long, global = true, help = "Overwrite cleared bytes with zeros")]
    zero_on_clear: bool,
}

impl DeviceArgs {
    fn options(&self) -> Result<DeviceOptions, Error> {
        let capacity = parse_size(&self.capacity)?;
        let capacity = usize::try_from(capacity).map_err(|_| {
            Error::new(ErrorKind::Usage)
                .with_message("capacity is too large")
                .with_hint("Use a smaller --capacity value.")
        })?;
        let ttl = parse_duration(&self.ttl)?;
        let policy = if self.exclusive {
            OpenPolicy::Exclusive
        } else {
            OpenPolicy::Shared
        };
        Ok(DeviceOptions::new(capacity, ttl)
            .with_open_policy(policy)
            .with_zero_on_clear(self.zero_on_clear))
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Drive sessions from an op script",
        long_about = r#"Run a line-oriented op script against one buffer.

Ops (one per line; blank lines and `#` comments are skipped):
  open <name>                    open a session
  close <name>                   close it
  write <name> <text...>         write text at the session cursor
  read <name> <max>              read up to <max> bytes from the cursor
  seek <name> <set|cur|end> <n>  move the cursor
  clear <name>                   discard all data
  sleep <duration>               wait (background clears are reported on stderr)
  snapshot                       print the buffer state

Each op prints one JSON line. Failed ops print `"ok":false` and the script
continues; malformed lines and interrupts stop it."#,
        after_help = r#"EXAMPLES
  $ ttlbuf --capacity 16 --ttl 1s run -f demo.txt
  $ printf 'open a\nwrite a hi\nsnapshot\n' | ttlbuf run

NOTES
  - Exit code is 0 when every op succeeded, else the code of the first failure.
  - Ctrl-C interrupts a blocked op and stops the script."#
    )]
    Run {
        #[arg(
            short = 'f',
            long = "file",
            help = "Script file (default: stdin)",
            value_hint = ValueHint::FilePath
        )]
        file: Option<PathBuf>,
    },
    #[command(
        about = "Measure lock contention with concurrent writers",
        long_about = r#"Run writer threads at disjoint regions of one buffer plus readers that check
for torn writes, then verify the final buffer equals the union of all writes.

Ignores --capacity and --ttl: capacity is writers x region, and the idle timer is
kept far from firing."#,
        after_help = r#"EXAMPLES
  $ ttlbuf bench
  $ ttlbuf bench --writers 8 --region 1K --rounds 5000 --format json"#
    )]
    Bench {
        #[arg(long, default_value_t = 4, help = "Concurrent writer sessions")]
        writers: usize,
        #[arg(long, default_value_t = 2, help = "Concurrent reader sessions")]
        readers: usize,
        #[arg(long, default_value = "256", help = "Bytes per writer region (K/M allowed)")]
        region: String,
        #[arg(long, default_value_t = 1000, help = "Writes per writer")]
        rounds: u64,
        #[arg(long, default_value = "both", value_enum, help = "Output: json|table|both")]
        format: bench::BenchFormat,
    },
    #[command(
        about = "Print version info as JSON",
        long_about = r#"Emit version info as JSON (stable, machine-readable)."#,
        after_help = r#"EXAMPLES
  $ ttlbuf version"#
    )]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        long_about = r#"Generate shell completion scripts.

Prints a completion script for the given shell to stdout."#,
        after_help = r#"EXAMPLES
  $ ttlbuf completion bash > ~/.local/share/bash-completion/completions/ttlbuf
  $ ttlbuf completion zsh > ~/.zfunc/_ttlbuf
  $ ttlbuf completion fish > ~/.config/fish/completions/ttlbuf.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn parse_size(input: &str) -> Result<u64, Error> {
    let trimmed = input.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or_else(|| trimmed.len());
    let digits = trimmed[..split].trim();
    let suffix = trimmed[split..].trim();

    let value: u64 = digits.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid size")
            .with_hint("Use bytes or K/M/G (e.g. 4K).")
            .with_source(err)
    })?;

    let multiplier = match suffix {
        "" => 1,
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        _ => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("invalid size suffix")
                .with_hint("Use K/M/G (e.g. 4K)."));
        }
    };

    value.checked_mul(multiplier).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("size overflow")
            .with_hint("Use a smaller size value.")
    })
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint("Use a number plus ms|s|m|h (e.g. 10s).")
    };
    let trimmed = input.trim();
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => ("", ""),
    };
    if num_str.is_empty() || unit.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

fn add_interrupted_hint(err: Error) -> Error {
    if err.kind() == ErrorKind::Interrupted && err.hint().is_none() {
        return err.with_hint("Interrupted by signal; no partial changes were made.");
    }
    err
}

fn emit_json_line(value: &Value) {
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("ttlbuf {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json_line(&json!({
            "name": "ttlbuf",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> String {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128)
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        let label = colorize_label("notice:", color_mode.use_color(is_tty), AnsiColor::Yellow);
        eprintln!("{label} {} (device: {})", notice.message, notice.device);
        return;
    }

    let value = notice_json(notice);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Interrupted => "interrupted".to_string(),
        ErrorKind::NoSpace => "no space left in buffer".to_string(),
        ErrorKind::InvalidArgument => "invalid argument".to_string(),
        ErrorKind::Busy => "device is busy".to_string(),
        ErrorKind::NoDevice => "no such device".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

/// Structured error body shared by fatal errors and failed script ops.
fn error_body(err: &Error) -> Map<String, Value> {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("errno".to_string(), json!(to_errno(err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    inner
}

fn error_json(err: &Error) -> Value {
    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(error_body(err)));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!(
            "{} {offset}",
            colorize_label("offset:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
