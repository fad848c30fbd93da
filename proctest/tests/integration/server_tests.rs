use std::time::{Duration, Instant};

use proctest_common::ports::port_in_use;
use proctest_common::{HarnessError, ServerInstance, ServerStatus, WaitKind};

use crate::common::{allocator, assert_contains, mock_config, started_server};

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_server_start_stop_restart() {
    crate::test_log!("TEST START: test_server_start_stop_restart");
    let mut server = ServerInstance::new(&mock_config(), allocator()).unwrap();
    assert_eq!(server.status(), ServerStatus::NeverStarted);
    assert!(server.default_user().is_some());
    assert!(matches!(server.stop(), Err(HarnessError::NotRunning)));
    assert_eq!(server.status(), ServerStatus::NeverStarted);

    server.start().unwrap();
    assert_eq!(server.status(), ServerStatus::Running);
    assert!(port_in_use(server.address(), server.port()).unwrap());
    assert!(server.pid().is_some());

    server.stop().unwrap();
    assert_eq!(server.status(), ServerStatus::Stopped);
    assert!(!port_in_use(server.address(), server.port()).unwrap());
    assert!(matches!(server.stop(), Err(HarnessError::NotRunning)));

    server.start().unwrap();
    assert_eq!(server.status(), ServerStatus::Running);
    server.destroy().unwrap();
    crate::test_log!("TEST PASS: test_server_start_stop_restart");
}

#[test]
fn test_server_double_start_conflicts() {
    let mut server = started_server();
    let err = server.start().unwrap_err();
    assert!(matches!(err, HarnessError::AlreadyRunning));
    assert_eq!(err.kind(), "ResourceConflict");
    assert_eq!(server.status(), ServerStatus::Running);
}

#[test]
fn test_server_destroy_is_idempotent_and_final() {
    let mut server = started_server();
    let data_dir = server.data_dir().to_path_buf();
    let port = server.port();
    assert!(allocator().is_reserved(port));

    server.destroy().unwrap();
    server.destroy().unwrap();
    assert!(server.is_destroyed());
    assert!(!data_dir.exists());
    assert!(!allocator().is_reserved(port));

    assert!(matches!(server.start(), Err(HarnessError::Destroyed { .. })));
    assert!(matches!(
        server.config("a", "b"),
        Err(HarnessError::Destroyed { .. })
    ));
    assert!(matches!(
        server.create_user(None, None),
        Err(HarnessError::Destroyed { .. })
    ));
}

#[test]
fn test_concurrent_servers_get_distinct_ports() {
    let a = ServerInstance::new(&mock_config(), allocator()).unwrap();
    let b = ServerInstance::new(&mock_config(), allocator()).unwrap();
    assert_ne!(a.port(), b.port());
    assert_ne!(a.data_dir(), b.data_dir());
}

#[test]
fn test_create_user_scrapes_key() {
    let mut server = ServerInstance::new(&mock_config(), allocator()).unwrap();
    let user = server.create_user(Some("alice"), Some("acme")).unwrap();
    assert_eq!(user.user, "alice");
    assert_eq!(user.org, "acme");
    assert_eq!(user.key.len(), 36, "unexpected key {:?}", user.key);
    assert_eq!(user.as_config_value(), format!("acme/alice/{}", user.key));

    // The organization already exists; only the user is new.
    let bob = server.create_user(Some("bob"), Some("acme")).unwrap();
    assert_ne!(bob.key, user.key);

    let err = server.create_user(Some("alice"), Some("acme")).unwrap_err();
    assert!(matches!(err, HarnessError::ExpectationMismatch(_)));

    // Default user plus the two created here.
    assert_eq!(server.users().len(), 3);
    assert!(server.client_data(&user).unwrap().is_empty());
}

#[test]
fn test_config_reloads_running_server() {
    let mut server = started_server();
    server.config("mock.note", "reload me").unwrap();
    assert_eq!(server.status(), ServerStatus::Running);

    let log_file = server.log_file().to_path_buf();
    wait_for("reload in server log", || {
        std::fs::read_to_string(&log_file).is_ok_and(|log| log.contains("configuration reloaded"))
    });
}

#[test]
fn test_crashing_server_reports_exit_code_and_log() {
    let mut server = ServerInstance::new(&mock_config(), allocator()).unwrap();
    server.config("mock.startup", "crash").unwrap();

    let err = server.start().unwrap_err();
    match &err {
        HarnessError::ServerStartup { reason, log } => {
            assert_contains(reason, "Exit code: 3");
            assert_contains(log, "startup crash requested");
        }
        other => panic!("expected ServerStartup, got {other:?}"),
    }
    // The crashed process was reaped, so a retry is allowed and fails again.
    assert!(matches!(
        server.start(),
        Err(HarnessError::ServerStartup { .. })
    ));
}

#[test]
fn test_server_that_never_listens_times_out() {
    let config = mock_config().with_server_startup(10, Duration::from_millis(20));
    let mut server = ServerInstance::new(&config, allocator()).unwrap();
    server.config("mock.startup", "silent").unwrap();

    let err = server.start().unwrap_err();
    assert!(
        matches!(
            err,
            HarnessError::Timeout {
                wait: WaitKind::Listen,
                ..
            }
        ),
        "unexpected error: {err:?}"
    );
    assert_eq!(server.status(), ServerStatus::Stopped);
}
