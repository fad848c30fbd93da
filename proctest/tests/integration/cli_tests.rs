use std::collections::HashSet;
use std::process::{Command, Output};

use crate::common::{assert_contains, assert_not_contains};

fn proctest(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_proctest"))
        .args(args)
        .output()
        .expect("Failed to run proctest")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_line(tap: &str, expected: &str) {
    assert!(
        tap.lines().any(|line| line == expected),
        "Expected line '{expected}' in TAP output:\n{tap}"
    );
}

#[test]
fn test_help_lists_subcommands() {
    crate::test_log!("TEST START: test_help_lists_subcommands");
    let output = proctest(&["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["run", "port", "datafile", "hook-log", "suite"] {
        assert_contains(&text, command);
    }
}

#[test]
fn test_run_mirrors_exit_code() {
    let output = proctest(&["run", "--", "sh", "-c", "echo out; exit 3"]);
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(stdout(&output), "out\n");

    let output = proctest(&["run", "--expect", "failure", "--", "sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(0));

    let output = proctest(&["run", "--expect", "success", "--", "sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(1));
    assert_contains(&String::from_utf8_lossy(&output.stderr), "expected zero exit status");
}

#[test]
fn test_file_log_is_flushed_on_failing_exit() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("run.jsonl");
    let output = Command::new(env!("CARGO_BIN_EXE_proctest"))
        .args(["--verbose", "run", "--", "sh", "-c", "exit 3"])
        .env("PROCTEST_LOG_FILE", &log)
        .output()
        .expect("Failed to run proctest");
    assert_eq!(output.status.code(), Some(3));

    let text = std::fs::read_to_string(&log).unwrap();
    assert_contains(&text, "process finished");
}

#[test]
fn test_run_json_reports_timeout() {
    let output = proctest(&["run", "--json", "--timeout", "200ms", "--", "sleep", "30"]);
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["timed_out"], true);
    assert!(result["exit_code"].as_i64().unwrap() < 0);
    assert_eq!(result["command"][0], "sleep");
}

#[test]
fn test_run_feeds_input_and_merges() {
    let output = proctest(&[
        "run",
        "--merge",
        "--input",
        "piped",
        "--",
        "sh",
        "-c",
        "cat; echo err >&2",
    ]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "pipederr\n");
    assert!(output.stderr.is_empty());
}

#[test]
fn test_port_reserves_distinct_ports() {
    let output = proctest(&["port", "--count", "3", "--start", "54100"]);
    assert!(output.status.success());
    let ports: HashSet<u16> = stdout(&output)
        .lines()
        .map(|line| line.parse().unwrap())
        .collect();
    assert_eq!(ports.len(), 3);
    assert!(ports.iter().all(|port| *port >= 54100));
}

#[test]
fn test_datafile_prints_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pending.data");
    std::fs::write(&path, "[\"description\":\"old\"]\n{\"description\":\"new\"}\n").unwrap();

    let output = proctest(&["datafile", path.to_str().unwrap()]);
    assert!(output.status.success());
    let lines: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 2);
    assert_contains(&lines[1], "\"new\"");
}

#[test]
fn test_hook_log_prints_record() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("original_on-add-x.log.in"),
        "% Called at 1700000000 with 'api:2'\n{\"a\":1}\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("original_on-add-x.log.out"),
        "{\"a\":1}\nfeedback\n! Exit code: 0\n",
    )
    .unwrap();

    let output = proctest(&["hook-log", dir.path().to_str().unwrap(), "on-add-x"]);
    assert!(output.status.success());
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["calls"][0]["args"], "api:2");
    assert_eq!(record["exit_code"], 0);
    assert_eq!(record["messages"][0], "feedback");
}

#[test]
fn test_suite_emits_tap() {
    crate::test_log!("TEST START: test_suite_emits_tap");
    let dir = tempfile::tempdir().unwrap();
    let suite = dir.path().join("suite.toml");
    std::fs::write(
        &suite,
        format!(
            r##"
[settings]
client = "{client}"
timeout = "5s"

[[hooks]]
name = "on-add-log"
content = "#!/bin/sh\nread task\necho \"$task\"\n"
logged = true

[[test]]
name = "echo greets"
command = "echo hello"
stdout_matches = "(?m)^hello$"

[[test]]
name = "fail is a failure"
args = ["fail", "2"]
expect = "failure"
stderr_contains = "exit code 2"

[[test]]
name = "add runs the hook"
command = "add one"
stdout_contains = "Created task 1."
hook = {{ name = "on-add-log", triggered = 1, exit_code = 0 }}

[[test]]
name = "not implemented"
args = ["echo"]
skip = "pending"

[[test]]
name = "wrong expectation"
command = "fail"
"##,
            client = env!("CARGO_BIN_EXE_proctest-mock-client")
        ),
    )
    .unwrap();

    let output = proctest(&["suite", suite.to_str().unwrap()]);
    let tap = stdout(&output);
    assert_eq!(output.status.code(), Some(1), "TAP output:\n{tap}");

    assert!(tap.starts_with("1..5\n"), "TAP output:\n{tap}");
    assert_line(&tap, "ok 1 - echo greets");
    assert_line(&tap, "ok 2 - fail is a failure");
    assert_line(&tap, "ok 3 - add runs the hook");
    assert_line(&tap, "ok 4 - not implemented # skip");
    assert_contains(&tap, "# SKIP:\n#       pending\n");
    assert_line(&tap, "not ok 5 - wrong expectation");
    assert_contains(&tap, "# FAIL: ExpectationMismatch:\n");
    assert_contains(&tap, "# 3 passed, 1 failed, 1 skipped. 60.00% passed.");
    assert_not_contains(&tap, "Bail out!");
}

#[test]
fn test_suite_bails_out_when_client_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let suite = dir.path().join("suite.toml");
    std::fs::write(
        &suite,
        "[settings]\nclient = \"no-such-client\"\n\n[[test]]\nname = \"x\"\nargs = []\n",
    )
    .unwrap();

    let output = proctest(&["suite", suite.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
    assert_contains(&stdout(&output), "Bail out!");
}
