// CLI integration tests for op scripts, errors, and auxiliary commands.
use std::io::Write;
use std::process::{Command, Output, Stdio};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_ttlbuf");
    Command::new(exe)
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn json_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_json)
        .collect()
}

fn run_script(args: &[&str], script: &str) -> Output {
    let mut child = cmd()
        .args(args)
        .arg("run")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(script.as_bytes())
        .expect("write script");
    child.wait_with_output().expect("output")
}

#[test]
fn example_scenario_from_stdin() {
    let script = "\
open h
write h HELLO
seek h end 0
write h !
read h 10
snapshot
";
    let output = run_script(&["--capacity", "16", "--ttl", "60s"], script);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 6);
    assert!(lines.iter().all(|line| line["ok"] == true));
    assert_eq!(lines[0]["op"], "open");
    assert_eq!(lines[0]["id"], 1);
    assert_eq!(lines[1]["written"], 5);
    assert_eq!(lines[2]["cursor"], 5);
    assert_eq!(lines[3]["written"], 1);
    assert_eq!(lines[4]["bytes"], 0);
    assert_eq!(lines[5]["length"], 6);
    assert_eq!(lines[5]["capacity"], 16);
    assert_eq!(lines[5]["data"], "HELLO!");
}

#[test]
fn script_file_with_comments() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("demo.txt");
    std::fs::write(
        &path,
        "# two sessions, separate cursors\n\nopen a\nopen b\nwrite a abc\nread b 8\n",
    )
    .expect("write script");

    let output = cmd()
        .args(["run", "-f", path.to_str().expect("utf8 path")])
        .output()
        .expect("run");
    assert!(output.status.success());
    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3]["data"], "abc");
    assert_eq!(lines[3]["cursor"], 3);
}

#[test]
fn boundary_seek_then_write_is_no_space() {
    let script = "open a\nseek a set 16\nwrite a z\nseek a set 17\nsnapshot\n";
    let output = run_script(&["--capacity", "16"], script);
    assert_eq!(output.status.code(), Some(4));

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[1]["cursor"], 16);
    assert_eq!(lines[2]["ok"], false);
    assert_eq!(lines[2]["error"]["kind"], "NoSpace");
    assert_eq!(lines[2]["error"]["errno"], 28);
    assert_eq!(lines[3]["error"]["kind"], "InvalidArgument");
    assert_eq!(lines[4]["length"], 0);
}

#[test]
fn idle_buffer_is_cleared_with_notice() {
    let script = "open a\nwrite a HELLO\nsleep 500ms\nsnapshot\n";
    let output = run_script(&["--capacity", "16", "--ttl", "100ms"], script);
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    assert_eq!(lines[3]["length"], 0);
    assert_eq!(lines[3]["state"], "empty");

    let notices = json_lines(&output.stderr);
    let notice = notices
        .iter()
        .find(|value| value["notice"]["kind"] == "expired")
        .expect("expired notice");
    assert_eq!(notice["notice"]["details"]["discarded"], 5);
    assert_eq!(notice["notice"]["cmd"], "run");
}

#[test]
fn writes_keep_the_buffer_alive() {
    let script = "\
open a
write a x
sleep 150ms
write a y
sleep 150ms
write a z
sleep 150ms
snapshot
";
    let output = run_script(&["--ttl", "400ms"], script);
    assert!(output.status.success());
    let lines = json_lines(&output.stdout);
    let snapshot = lines.last().expect("snapshot");
    assert_eq!(snapshot["data"], "xyz");
}

#[test]
fn exclusive_flag_rejects_second_open() {
    let output = run_script(&["--exclusive"], "open a\nopen b\n");
    assert_eq!(output.status.code(), Some(6));
    let lines = json_lines(&output.stdout);
    assert_eq!(lines[1]["error"]["kind"], "Busy");
}

#[test]
fn malformed_line_stops_with_usage_error() {
    let output = run_script(&[], "open a\nfrobnicate a\nsnapshot\n");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(json_lines(&output.stdout).len(), 1);

    let stderr = json_lines(&output.stderr);
    let err = stderr.last().expect("error json");
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(
        err["error"]["message"]
            .as_str()
            .expect("message")
            .contains("line 2")
    );
}

#[test]
fn invalid_capacity_is_usage_error() {
    let output = cmd()
        .args(["--capacity", "0", "run"])
        .stdin(Stdio::null())
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let err = json_lines(&output.stderr).pop().expect("error json");
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(err["error"]["hint"].is_string());
}

#[test]
fn version_emits_json() {
    let output = cmd().arg("version").output().expect("version");
    assert!(output.status.success());
    let value = parse_json(String::from_utf8_lossy(&output.stdout).trim());
    assert_eq!(value["name"], "ttlbuf");
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn completion_prints_script() {
    let output = cmd().args(["completion", "bash"]).output().expect("completion");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("ttlbuf"));
}
