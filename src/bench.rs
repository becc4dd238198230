// Contention benchmark for ttlbuf.
//
// Purpose:
// - Hammer one device with writer sessions at disjoint regions and reader sessions that look
//   for torn writes, then check the final buffer equals the union of all writes.
// - Emit machine-readable JSON to stdout and a human-readable table to stderr.
//
// Design notes:
// - Threads in one process; the lock under test is in-process.
// - The idle timer is set far out so a clear can never land mid-run.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Value, json};

use ttlbuf::api::{Device, DeviceOptions, Error, ErrorKind, Whence};

const BENCH_TTL: Duration = Duration::from_secs(3600);
const LATENCY_PREALLOC: u64 = 1 << 16;

#[derive(Clone, Debug)]
pub struct BenchArgs {
    pub writers: usize,
    pub readers: usize,
    pub region: usize,
    pub rounds: u64,
    pub format: BenchFormat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum BenchFormat {
    Json,
    Table,
    Both,
}

#[derive(Debug, Serialize)]
struct ContentionResult {
    bench: &'static str,
    capacity: usize,
    region_bytes: usize,
    writers: usize,
    readers: usize,
    writes: u64,
    reads: u64,
    duration_ms: f64,
    writes_per_sec: f64,
    mb_per_sec: f64,
    write_latency_ms: Value,
    torn_reads: u64,
    verified: bool,
}

pub fn run_bench(args: BenchArgs, program_version: &str) -> Result<(), Error> {
    if args.writers == 0 || args.region == 0 || args.rounds == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--writers, --region and --rounds must be positive")
            .with_hint("Try `ttlbuf bench --writers 4 --region 256 --rounds 1000`."));
    }
    let capacity = args.writers.checked_mul(args.region).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("writers x region overflows")
            .with_hint("Use fewer writers or a smaller region.")
    })?;

    let start = SystemTime::now();
    let result = bench_contention(&args, capacity)?;
    let verified = result.verified;
    tracing::debug!(
        writes = result.writes,
        torn = result.torn_reads,
        verified,
        "bench finished"
    );

    let output = json!({
        "name": "ttlbuf",
        "version": program_version,
        "ts": rfc3339_now(start),
        "system": system_json(),
        "params": {
            "writers": args.writers,
            "readers": args.readers,
            "region_bytes": args.region,
            "rounds": args.rounds,
            "debug_build": cfg!(debug_assertions),
        },
        "results": [result],
    });
    emit_bench_output(output, args.format)?;

    if !verified {
        return Err(Error::new(ErrorKind::Internal)
            .with_message("bench verification failed")
            .with_hint("Final buffer differs from the union of writes, or a torn read was seen."));
    }
    Ok(())
}

fn bench_contention(args: &BenchArgs, capacity: usize) -> Result<ContentionResult, Error> {
    let device = Device::create(DeviceOptions::new(capacity, BENCH_TTL))?;
    let stop = Arc::new(AtomicBool::new(false));
    let torn = Arc::new(AtomicU64::new(0));
    let reads = Arc::new(AtomicU64::new(0));
    let region = args.region;

    let suite_start = Instant::now();
    let (latencies, run_result) = thread::scope(|scope| {
        let readers: Vec<_> = (0..args.readers)
            .map(|_| {
                let device = &device;
                let stop = Arc::clone(&stop);
                let torn = Arc::clone(&torn);
                let reads = Arc::clone(&reads);
                scope.spawn(move || -> Result<(), Error> {
                    let mut session = device.open()?;
                    while !stop.load(Ordering::Relaxed) {
                        session.seek(Whence::Set, 0)?;
                        let bytes = session.read(capacity)?;
                        reads.fetch_add(1, Ordering::Relaxed);
                        if has_torn_region(&bytes, region) {
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        let writers: Vec<_> = (0..args.writers)
            .map(|idx| {
                let device = &device;
                let rounds = args.rounds;
                scope.spawn(move || -> Result<Vec<f64>, Error> {
                    let mut session = device.open()?;
                    let mut payload = vec![0u8; region];
                    let offset = (idx * region) as i64;
                    let mut latencies = latency_buffer(rounds);
                    for round in 0..rounds {
                        payload.fill(pattern_byte(idx, round));
                        let op_start = Instant::now();
                        session.seek(Whence::Set, offset)?;
                        let written = session.write(&payload)?;
                        latencies.push(op_start.elapsed().as_secs_f64() * 1000.0);
                        if written != region {
                            return Err(Error::new(ErrorKind::Internal)
                                .with_message("short write inside capacity")
                                .with_offset(offset));
                        }
                    }
                    Ok(latencies)
                })
            })
            .collect();

        let mut latencies = Vec::new();
        let mut first_err = None;
        for writer in writers {
            match writer.join() {
                Ok(Ok(mut samples)) => latencies.append(&mut samples),
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(_) => {
                    first_err.get_or_insert(
                        Error::new(ErrorKind::Internal).with_message("writer thread panicked"),
                    );
                }
            }
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            match reader.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(_) => {
                    first_err.get_or_insert(
                        Error::new(ErrorKind::Internal).with_message("reader thread panicked"),
                    );
                }
            }
        }
        (latencies, first_err.map_or(Ok(()), Err))
    });
    run_result?;
    let duration = suite_start.elapsed();

    let snapshot = device.snapshot();
    let last_round = args.rounds - 1;
    let expected: Vec<u8> = (0..args.writers)
        .flat_map(|idx| std::iter::repeat_n(pattern_byte(idx, last_round), region))
        .collect();
    let torn_reads = torn.load(Ordering::Relaxed);
    let verified = snapshot.data == expected && torn_reads == 0;
    device.shutdown();

    let writes = args.rounds * args.writers as u64;
    let secs = duration.as_secs_f64().max(1e-9);
    let mb = (writes as f64 * region as f64) / (1024.0 * 1024.0);
    let mut sorted = latencies;
    sorted.sort_by(|a, b| a.total_cmp(b));

    Ok(ContentionResult {
        bench: "contention",
        capacity,
        region_bytes: region,
        writers: args.writers,
        readers: args.readers,
        writes,
        reads: reads.load(Ordering::Relaxed),
        duration_ms: secs * 1000.0,
        writes_per_sec: writes as f64 / secs,
        mb_per_sec: mb / secs,
        write_latency_ms: latency_summary(&sorted),
        torn_reads,
        verified,
    })
}

// Consecutive rounds of one writer use different bytes, so a region mixing two rounds shows up.
fn pattern_byte(idx: usize, round: u64) -> u8 {
    b'A' + ((idx as u64).wrapping_add(round) % 26) as u8
}

fn latency_buffer(rounds: u64) -> Vec<f64> {
    Vec::with_capacity(rounds.min(LATENCY_PREALLOC) as usize)
}

// Every write covers a whole region, so a region holding more than one byte value is torn.
fn has_torn_region(bytes: &[u8], region: usize) -> bool {
    bytes
        .chunks(region)
        .any(|chunk| chunk.iter().any(|byte| *byte != chunk[0]))
}

fn emit_bench_output(value: Value, format: BenchFormat) -> Result<(), Error> {
    match format {
        BenchFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            Ok(())
        }
        BenchFormat::Table => emit_table(&value),
        BenchFormat::Both => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            emit_table(&value)
        }
    }
}

fn emit_table(value: &Value) -> Result<(), Error> {
    let io_err = |err: io::Error| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write bench table")
            .with_source(err)
    };
    let mut stderr = io::stderr().lock();
    writeln!(stderr, "ttlbuf bench (table)").map_err(io_err)?;

    let results = value
        .get("results")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("bench results missing"))?;

    writeln!(
        stderr,
        "{:>10}  {:>9}  {:>9}  {:>8}  {:>10}  {:>9}  {:>9}  {}",
        "bench", "capacity", "writers", "readers", "writes/s", "p95 ms", "torn", "verified"
    )
    .map_err(io_err)?;

    for item in results {
        let bench = item.get("bench").and_then(|v| v.as_str()).unwrap_or("?");
        let capacity = item.get("capacity").and_then(|v| v.as_u64()).unwrap_or(0);
        let writers = item.get("writers").and_then(|v| v.as_u64()).unwrap_or(0);
        let readers = item.get("readers").and_then(|v| v.as_u64()).unwrap_or(0);
        let per_sec = item
            .get("writes_per_sec")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        let p95 = item
            .get("write_latency_ms")
            .and_then(|v| v.get("p95"))
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        let torn = item.get("torn_reads").and_then(|v| v.as_u64()).unwrap_or(0);
        let verified = item.get("verified").and_then(|v| v.as_bool()).unwrap_or(false);

        writeln!(
            stderr,
            "{:>10}  {:>9}  {:>9}  {:>8}  {:>10.0}  {:>9.4}  {:>9}  {}",
            bench,
            format_bytes(capacity),
            writers,
            readers,
            per_sec,
            p95,
            torn,
            if verified { "yes" } else { "NO" }
        )
        .map_err(io_err)?;
    }

    Ok(())
}

fn latency_summary(sorted_ms: &[f64]) -> Value {
    if sorted_ms.is_empty() {
        return json!({});
    }
    let mut map = BTreeMap::new();
    map.insert("min", sorted_ms.first().copied().unwrap_or(0.0));
    map.insert("p50", quantile(sorted_ms, 0.50));
    map.insert("p95", quantile(sorted_ms, 0.95));
    map.insert("max", sorted_ms.last().copied().unwrap_or(0.0));
    json!(map)
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let clamped = q.clamp(0.0, 1.0);
    let idx = ((sorted.len() - 1) as f64 * clamped).round() as usize;
    sorted.get(idx).copied().unwrap_or_else(|| sorted[sorted.len() - 1])
}

fn system_json() -> Value {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": cpus,
    })
}

fn rfc3339_now(ts: SystemTime) -> String {
    let dur = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs() as i64;
    let nsec = dur.subsec_nanos();
    let tm = time::OffsetDateTime::from_unix_timestamp(secs)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    let tm = tm.replace_nanosecond(nsec).unwrap_or(tm);
    tm.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn format_bytes(value: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;

    let v = value as f64;
    if v >= MB {
        format!("{:.1}MiB", v / MB)
    } else if v >= KB {
        format!("{:.1}KiB", v / KB)
    } else {
        format!("{value}B")
    }
}
