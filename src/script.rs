//! Purpose: Execute line-oriented op scripts against one device for `ttlbuf run`.
//! Exports: `run_script`, `ScriptSummary`.
//! Role: Stand-in for a registration layer: names sessions, forwards calls, reports results.
//! Invariants: One JSON line per executed op; device failures never stop the script.
//! Invariants: Usage and interrupt errors stop the script after reporting.
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use ttlbuf::api::{
    Device, DeviceOptions, Error, ErrorKind, ExpiryEvent, ExpiryListener, InterruptFlag, Session,
    StoreSnapshot, SystemClock, Whence,
};
use ttlbuf::notice::{Notice, expiry_notice};

use super::{error_body, notice_time_now, parse_duration};

const DEVICE_LABEL: &str = "ttlbuf0";
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub(super) struct ScriptSummary {
    pub ops: usize,
    pub failures: usize,
    pub first_failure: Option<ErrorKind>,
}

#[derive(Debug, PartialEq, Eq)]
enum Op {
    Open { name: String },
    Close { name: String },
    Write { name: String, text: String },
    Read { name: String, max: usize },
    Seek { name: String, whence: Whence, offset: i64 },
    Clear { name: String },
    Sleep { duration: Duration },
    Snapshot,
}

impl Op {
    fn label(&self) -> &'static str {
        match self {
            Op::Open { .. } => "open",
            Op::Close { .. } => "close",
            Op::Write { .. } => "write",
            Op::Read { .. } => "read",
            Op::Seek { .. } => "seek",
            Op::Clear { .. } => "clear",
            Op::Sleep { .. } => "sleep",
            Op::Snapshot => "snapshot",
        }
    }

    fn session(&self) -> Option<&str> {
        match self {
            Op::Open { name }
            | Op::Close { name }
            | Op::Write { name, .. }
            | Op::Read { name, .. }
            | Op::Seek { name, .. }
            | Op::Clear { name } => Some(name.as_str()),
            Op::Sleep { .. } | Op::Snapshot => None,
        }
    }
}

// Forwards timer outcomes off the timer thread; the runner turns them into notices.
struct ChannelListener {
    tx: mpsc::Sender<ExpiryEvent>,
}

impl ExpiryListener for ChannelListener {
    fn on_expiry(&self, event: &ExpiryEvent) {
        let _ = self.tx.send(*event);
    }
}

struct Runner<'a> {
    device: Device,
    sessions: BTreeMap<String, Session>,
    interrupt: InterruptFlag,
    events: mpsc::Receiver<ExpiryEvent>,
    on_notice: &'a mut dyn FnMut(&Notice),
}

pub(super) fn run_script(
    input: &mut dyn BufRead,
    options: DeviceOptions,
    interrupt: InterruptFlag,
    out: &mut dyn Write,
    on_notice: &mut dyn FnMut(&Notice),
) -> Result<ScriptSummary, Error> {
    let (tx, events) = mpsc::channel();
    let listener: Arc<dyn ExpiryListener> = Arc::new(ChannelListener { tx });
    let device = Device::create_with(options, Arc::new(SystemClock::new()), Some(listener))?;
    let mut runner = Runner {
        device,
        sessions: BTreeMap::new(),
        interrupt,
        events,
        on_notice,
    };

    let result = runner.run_lines(input, out);
    runner.finish();
    result
}

impl Runner<'_> {
    fn run_lines(
        &mut self,
        input: &mut dyn BufRead,
        out: &mut dyn Write,
    ) -> Result<ScriptSummary, Error> {
        let mut summary = ScriptSummary::default();
        let mut line = String::new();
        let mut line_no = 0usize;
        loop {
            line.clear();
            let read = input.read_line(&mut line).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read script")
                    .with_source(err)
            })?;
            if read == 0 {
                break;
            }
            line_no += 1;
            self.check_interrupt()?;

            let Some(op) = parse_op(&line, line_no)? else {
                continue;
            };
            let result = self.apply(&op);
            self.drain_events();
            summary.ops += 1;

            let value = match &result {
                Ok(fields) => op_json(&op, Ok(fields)),
                Err(err) => {
                    summary.failures += 1;
                    summary.first_failure.get_or_insert(err.kind());
                    op_json(&op, Err(err))
                }
            };
            writeln!(out, "{}", serde_json::to_string(&value).unwrap_or_default())
                .and_then(|_| out.flush())
                .map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write op result")
                        .with_source(err)
                })?;

            if let Err(err) = result {
                if matches!(err.kind(), ErrorKind::Usage | ErrorKind::Interrupted) {
                    return Err(err);
                }
            }
        }
        Ok(summary)
    }

    fn apply(&mut self, op: &Op) -> Result<Map<String, Value>, Error> {
        let mut fields = Map::new();
        match op {
            Op::Open { name } => {
                if self.sessions.contains_key(name) {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!("session `{name}` is already open"))
                        .with_hint("Close it first or pick another name."));
                }
                let session = self.device.open()?.with_interrupt(self.interrupt.clone());
                fields.insert("id".to_string(), json!(session.id()));
                self.sessions.insert(name.clone(), session);
            }
            Op::Close { name } => {
                let session = self.sessions.remove(name).ok_or_else(|| unknown_session(name))?;
                session.close();
            }
            Op::Write { name, text } => {
                let session = self.session(name)?;
                let written = session.write(text.as_bytes())?;
                fields.insert("written".to_string(), json!(written));
                fields.insert("cursor".to_string(), json!(session.cursor()));
            }
            Op::Read { name, max } => {
                let session = self.session(name)?;
                let bytes = session.read(*max)?;
                fields.insert("bytes".to_string(), json!(bytes.len()));
                fields.insert(
                    "data".to_string(),
                    json!(String::from_utf8_lossy(&bytes)),
                );
                fields.insert("cursor".to_string(), json!(session.cursor()));
            }
            Op::Seek {
                name,
                whence,
                offset,
            } => {
                let session = self.session(name)?;
                let cursor = session.seek(*whence, *offset)?;
                fields.insert("cursor".to_string(), json!(cursor));
            }
            Op::Clear { name } => {
                let session = self.session(name)?;
                let discarded = session.clear()?;
                fields.insert("discarded".to_string(), json!(discarded));
            }
            Op::Sleep { duration } => {
                self.sleep(*duration)?;
                fields.insert("ms".to_string(), json!(duration.as_millis() as u64));
            }
            Op::Snapshot => {
                fields.extend(snapshot_fields(&self.device.snapshot()));
            }
        }
        Ok(fields)
    }

    fn session(&mut self, name: &str) -> Result<&mut Session, Error> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| unknown_session(name))
    }

    // Sleeps in slices so background clears are reported close to when they happen.
    fn sleep(&mut self, duration: Duration) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            self.drain_events();
            self.check_interrupt()?;
            let elapsed = start.elapsed();
            if elapsed >= duration {
                return Ok(());
            }
            thread::sleep((duration - elapsed).min(SLEEP_SLICE));
        }
    }

    fn check_interrupt(&self) -> Result<(), Error> {
        if self.interrupt.is_pending() {
            return Err(Error::new(ErrorKind::Interrupted)
                .with_message("script interrupted")
                .with_hint("Remaining ops were not run."));
        }
        Ok(())
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let Some(notice) = expiry_notice(&event, "run", DEVICE_LABEL, notice_time_now()) {
                (self.on_notice)(&notice);
            }
        }
    }

    fn finish(mut self) {
        for (_, session) in std::mem::take(&mut self.sessions) {
            session.close();
        }
        let Runner {
            device,
            events,
            on_notice,
            ..
        } = self;
        device.shutdown();
        while let Ok(event) = events.try_recv() {
            if let Some(notice) = expiry_notice(&event, "run", DEVICE_LABEL, notice_time_now()) {
                on_notice(&notice);
            }
        }
    }
}

fn unknown_session(name: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("no open session named `{name}`"))
        .with_hint("Open it first with `open <name>`.")
}

fn op_json(op: &Op, result: Result<&Map<String, Value>, &Error>) -> Value {
    let mut map = Map::new();
    map.insert("op".to_string(), json!(op.label()));
    if let Some(name) = op.session() {
        map.insert("session".to_string(), json!(name));
    }
    match result {
        Ok(fields) => {
            map.insert("ok".to_string(), json!(true));
            map.extend(fields.clone());
        }
        Err(err) => {
            map.insert("ok".to_string(), json!(false));
            map.insert("error".to_string(), Value::Object(error_body(err)));
        }
    }
    Value::Object(map)
}

fn snapshot_fields(snapshot: &StoreSnapshot) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("capacity".to_string(), json!(snapshot.capacity));
    map.insert("length".to_string(), json!(snapshot.length));
    map.insert("state".to_string(), json!(snapshot.state.as_str()));
    map.insert("idle_ms".to_string(), json!(snapshot.idle.as_millis() as u64));
    map.insert(
        "deadline_ms".to_string(),
        json!(snapshot.deadline.map(|deadline| deadline.as_millis() as u64)),
    );
    map.insert("open_sessions".to_string(), json!(snapshot.open_sessions));
    map.insert(
        "data".to_string(),
        json!(String::from_utf8_lossy(&snapshot.data)),
    );
    map
}

fn parse_op(line: &str, line_no: usize) -> Result<Option<Op>, Error> {
    let line = line.trim_end_matches(['\n', '\r']);
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let (verb, rest) = split_word(trimmed);
    let op = match verb {
        "open" => Op::Open {
            name: single_name(verb, rest, line_no)?,
        },
        "close" => Op::Close {
            name: single_name(verb, rest, line_no)?,
        },
        "clear" => Op::Clear {
            name: single_name(verb, rest, line_no)?,
        },
        "write" => {
            let (name, text) = split_word(rest);
            if name.is_empty() {
                return Err(malformed(line_no, "write needs a session name"));
            }
            Op::Write {
                name: name.to_string(),
                text: text.to_string(),
            }
        }
        "read" => {
            let args = words::<2>(verb, rest, line_no)?;
            let max = args[1]
                .parse()
                .map_err(|_| malformed(line_no, "read <max> must be a byte count"))?;
            Op::Read {
                name: args[0].to_string(),
                max,
            }
        }
        "seek" => {
            let args = words::<3>(verb, rest, line_no)?;
            let whence: Whence = args[1].parse().map_err(|err: Error| {
                err.with_message(format!("line {line_no}: invalid whence `{}`", args[1]))
            })?;
            let offset = args[2]
                .parse()
                .map_err(|_| malformed(line_no, "seek offset must be an integer"))?;
            Op::Seek {
                name: args[0].to_string(),
                whence,
                offset,
            }
        }
        "sleep" => {
            let args = words::<1>(verb, rest, line_no)?;
            let duration = parse_duration(args[0]).map_err(|err| {
                err.with_message(format!("line {line_no}: invalid sleep duration"))
            })?;
            Op::Sleep { duration }
        }
        "snapshot" => {
            words::<0>(verb, rest, line_no)?;
            Op::Snapshot
        }
        other => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("line {line_no}: unknown op `{other}`"))
                .with_hint("Ops: open|close|write|read|seek|clear|sleep|snapshot."));
        }
    };
    Ok(Some(op))
}

// Splits off the first whitespace-delimited word; the remainder keeps inner spacing.
fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => {
            let (word, rest) = input.split_at(idx);
            // Drop exactly one separator so `write a  x` writes " x".
            let mut chars = rest.chars();
            chars.next();
            (word, chars.as_str())
        }
        None => (input, ""),
    }
}

fn words<'a, const N: usize>(verb: &str, rest: &'a str, line_no: usize) -> Result<[&'a str; N], Error> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    <[&str; N]>::try_from(parts).map_err(|parts| {
        malformed(
            line_no,
            &format!("{verb} takes {N} argument(s), got {}", parts.len()),
        )
    })
}

fn single_name(verb: &str, rest: &str, line_no: usize) -> Result<String, Error> {
    let [name] = words::<1>(verb, rest, line_no)?;
    Ok(name.to_string())
}

fn malformed(line_no: usize, message: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("line {line_no}: {message}"))
        .with_hint("Run `ttlbuf run --help` for the op syntax.")
}
