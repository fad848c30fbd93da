use std::time::Duration;

use proctest_common::datafile::parse_datafile;
use proctest_common::{ClientSession, FakeTime, HarnessError, RunOptions};

use crate::common::{assert_contains, assert_not_contains, mock_config, started_server};

fn session() -> ClientSession {
    ClientSession::new(&mock_config()).expect("Failed to create client session")
}

#[test]
fn test_session_runs_client_in_isolation() {
    crate::test_log!("TEST START: test_session_runs_client_in_isolation");
    let session = session();
    let result = session.call("echo hello world").unwrap();
    assert_eq!(result.stdout, "hello world\n");
    assert_eq!(result.exit_code, 0);

    let rc = session.rc_content().unwrap();
    assert!(rc.iter().any(|line| line == "hooks=off"));
    assert_eq!(
        session.env().get("TASKDATA").map(String::as_str),
        Some(session.data_dir().to_str().unwrap())
    );
    crate::test_log!("TEST PASS: test_session_runs_client_in_isolation");
}

#[test]
fn test_expectations() {
    let session = session();
    let result = session
        .expect_failure(["fail", "3"], &RunOptions::default())
        .unwrap();
    assert_eq!(result.exit_code, 3);

    let err = session
        .expect_success(["fail", "3"], &RunOptions::default())
        .unwrap_err();
    let command = err.as_command_error().expect("expectation mismatch");
    assert_eq!(command.exit_code, 3);
    assert_contains(command.stderr.as_deref().unwrap(), "failing with exit code 3");
    assert_contains(&err.to_string(), "expected to exit with zero status");

    let err = session
        .expect_failure(["echo", "ok"], &RunOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), "ExpectationMismatch");
}

#[test]
fn test_input_and_merged_streams() {
    let session = session();
    let result = session
        .expect_success(["cat"], &RunOptions::default().input("line one\nline two\n"))
        .unwrap();
    assert_eq!(result.stdout, "line one\nline two\n");

    let result = session
        .invoke(["fail"], &RunOptions::default().merge_streams())
        .unwrap();
    assert!(result.stderr.is_none());
    assert_contains(&result.stdout, "failing with exit code 1");
}

#[test]
fn test_hanging_client_is_killed() {
    let session = session();
    let result = session
        .invoke(
            ["sleep", "30"],
            &RunOptions::default().timeout(Duration::from_millis(300)),
        )
        .unwrap();
    assert!(result.timed_out);
    assert!(result.signal().is_some(), "exit code {}", result.exit_code);
    assert!(result.duration < Duration::from_secs(20));
}

#[test]
fn test_config_round_trip() {
    let session = session();
    session.config("color", "off").unwrap();
    assert!(session.rc_content().unwrap().contains(&"color=off".to_string()));

    session.del_config("color").unwrap();
    assert!(
        !session
            .rc_content()
            .unwrap()
            .iter()
            .any(|line| line.starts_with("color="))
    );
}

#[test]
fn test_added_tasks_land_in_data_file() {
    let session = session();
    let result = session.call("add buy milk").unwrap();
    assert_contains(&result.stdout, "Created task 1.");
    session.call("add walk dog").unwrap();

    let lines = parse_datafile(&session.data_dir().join("pending.data")).unwrap();
    assert_eq!(lines.len(), 2);
    let first = lines[0].as_json().expect("task is JSON");
    assert_eq!(first["description"], "buy milk");
    assert_eq!(first["status"], "pending");
}

#[test]
fn test_logged_hook_is_recorded() {
    let mut session = session();
    let hooks = session.activate_hooks().unwrap();
    hooks
        .add_logged(
            "on-add-echo",
            "#!/bin/sh\nread task\necho \"$task\"\necho 'hook saw it'\n",
        )
        .unwrap();
    hooks
        .add_logged("on-launch-quiet", "#!/bin/sh\nexit 0\n")
        .unwrap();
    assert_eq!(hooks.enabled().len(), 2);

    let result = session.call("add feed cat").unwrap();
    assert_contains(&result.stdout, "hook saw it");

    let hooks = session.hooks().unwrap();
    let on_add = hooks.get("on-add-echo").unwrap();
    on_add.assert_triggered_count(1).unwrap();
    on_add.assert_exit_code(0).unwrap();
    on_add.assert_valid_json_output().unwrap();
    assert!(on_add.assert_invalid_json_output().is_err());

    let logs = on_add.logs().unwrap();
    assert_contains(&logs.calls[0].args, "api:2");
    assert_contains(&logs.calls[0].args, "command:add");
    assert_eq!(logs.input_json.len(), 1);
    assert_eq!(logs.messages, vec!["hook saw it".to_string()]);

    session.call("echo again").unwrap();
    hooks.get("on-launch-quiet").unwrap().assert_triggered_count(2).unwrap();
    on_add.assert_triggered_count(1).unwrap();
}

#[test]
fn test_hook_with_invalid_json_fails_command() {
    let mut session = session();
    session
        .activate_hooks()
        .unwrap()
        .add_logged(
            "on-add-broken",
            "#!/bin/sh\ncat > /dev/null\necho '{\"description\": broken'\n",
        )
        .unwrap();

    let result = session
        .expect_failure(["add", "oops"], &RunOptions::default())
        .unwrap();
    assert_contains(result.stderr.as_deref().unwrap(), "Hook Error");

    let hook = session.hooks().unwrap().get("on-add-broken").unwrap();
    hook.assert_triggered_count(1).unwrap();
    hook.assert_invalid_json_output().unwrap();
    assert!(hook.assert_valid_json_output().is_err());
    assert_eq!(hook.logs().unwrap().invalid_output_positions(), vec![1]);
    assert!(!session.data_dir().join("pending.data").exists());
}

#[test]
fn test_disabled_and_removed_hooks_do_not_run() {
    let mut session = session();
    let hooks = session.activate_hooks().unwrap();
    hooks
        .add("on-launch-fail", "#!/bin/sh\necho 'launch refused'\nexit 1\n")
        .unwrap();
    let err = session
        .expect_success(["echo", "x"], &RunOptions::default())
        .unwrap_err();
    assert_contains(&err.to_string(), "launch refused");

    let hooks = session.hooks_mut().unwrap();
    hooks.get("on-launch-fail").unwrap().disable().unwrap();
    session.call("echo x").unwrap();

    let hooks = session.hooks_mut().unwrap();
    hooks.remove("on-launch-fail").unwrap();
    assert!(hooks.is_empty());
    assert!(!hooks.dir().join("on-launch-fail").exists());
    hooks.add("on-launch-fail", "#!/bin/sh\nexit 0\n").unwrap();
    session.call("echo x").unwrap();
}

#[test]
fn test_bound_session_syncs_to_server() {
    crate::test_log!("TEST START: test_bound_session_syncs_to_server");
    let mut session = session();
    let server = started_server();
    let server_dir = server.data_dir().to_path_buf();
    let address = server.reservation().to_string();

    let credentials = session.adopt_server(server).unwrap();
    let rc = session.rc_content().unwrap();
    assert!(rc.contains(&format!("taskd.server={address}")));
    assert!(rc.contains(&format!("taskd.credentials={}", credentials.as_config_value())));

    session.call("add sync me").unwrap();
    let result = session.call("sync").unwrap();
    assert_contains(&result.stdout, "Sync successful. 1 tasks uploaded.");

    let data = session.server().unwrap().client_data(&credentials).unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].as_json().unwrap()["description"], "sync me");

    let client_dir = session.data_dir().to_path_buf();
    session.destroy().unwrap();
    assert!(!client_dir.exists());
    assert!(!server_dir.exists());
    crate::test_log!("TEST PASS: test_bound_session_syncs_to_server");
}

#[test]
fn test_sync_without_server_fails() {
    let session = session();
    let result = session
        .expect_failure(["sync"], &RunOptions::default())
        .unwrap();
    assert_contains(result.stderr.as_deref().unwrap(), "taskd.server");
}

#[test]
fn test_destroyed_session_rejects_everything() {
    let mut session = session();
    let dir = session.data_dir().to_path_buf();
    session.destroy().unwrap();
    session.destroy().unwrap();
    assert!(session.is_destroyed());
    assert!(!dir.exists());

    assert!(matches!(
        session.call("echo x"),
        Err(HarnessError::Destroyed { .. })
    ));
    assert!(matches!(
        session.config("a", "b"),
        Err(HarnessError::Destroyed { .. })
    ));
}

#[test]
fn test_diag_merges_into_failed_result() {
    let session = session();
    let failed = session.invoke(["fail"], &RunOptions::default()).unwrap();
    let merged = session.diag(Some(&failed)).unwrap();
    assert_contains(&merged.stdout, "Debugging information");
    assert_contains(&merged.stdout, "proctest-mock-client");
}

#[test]
fn test_faketime_needs_shim() {
    let mut session = session();
    match session.faketime(Some(FakeTime::Offset("-1d".into()))) {
        Ok(()) => {
            assert!(session.command_prefix().iter().any(|part| part.ends_with("faketime")));
            session.faketime(None).unwrap();
            assert_eq!(session.command_prefix().len(), 1);
        }
        Err(HarnessError::Skipped(reason)) => assert_not_contains(&reason, "panic"),
        Err(other) => panic!("unexpected error: {other:?}"),
    }
}
