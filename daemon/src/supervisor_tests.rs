use super::*;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn test_crash_tracker_backoff() {
    let unit = Duration::from_secs(1);
    let mut tracker = CrashTracker::new(Duration::from_secs(10), unit, 5);
    let mut now = Instant::now();
    let mut delays = Vec::new();

    loop {
        match tracker.on_crash(now) {
            RestartDecision::Retry { delay, .. } => {
                delays.push(delay);
                now += delay;
                tracker.record_attempt(now);
                now += Duration::from_secs(1);
            }
            RestartDecision::GiveUp { crashes } => {
                assert_eq!(crashes, 6);
                break;
            }
        }
    }

    assert_eq!(delays.len(), 5);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*delays.last().unwrap(), Duration::from_secs(32));
    assert_eq!(delays[0], Duration::from_secs(2));
}

#[test]
fn test_crash_tracker_window_resets_count() {
    let mut tracker = CrashTracker::new(Duration::from_secs(10), Duration::from_secs(1), 5);
    let start = Instant::now();

    assert!(matches!(
        tracker.on_crash(start),
        RestartDecision::Retry { attempt: 1, .. }
    ));
    tracker.record_attempt(start);
    assert!(matches!(
        tracker.on_crash(start + Duration::from_secs(3)),
        RestartDecision::Retry { attempt: 2, .. }
    ));
    tracker.record_attempt(start + Duration::from_secs(3));

    // Long healthy run since the last attempt
    assert!(matches!(
        tracker.on_crash(start + Duration::from_secs(60)),
        RestartDecision::Retry { attempt: 1, .. }
    ));

    tracker.reset();
    assert_eq!(tracker.count(), 0);
}

#[test]
fn test_settings_from_config() {
    let config = ProxyConfig::default();
    let settings = SupervisorSettings::from_config(&config);
    assert_eq!(settings.port_wait_timeout, Duration::from_secs(30));
    assert_eq!(settings.stop_grace, Duration::from_secs(5));
    assert_eq!(settings.max_restarts, 5);
    assert_eq!(settings.port_dial_timeout, Duration::from_millis(100));
}

#[cfg(unix)]
mod process {
    use super::*;

    const LONG_RUNNING: &str = r#"#!/bin/sh
echo run >> "$(dirname "$0")/runs"
exec sleep 30
"#;

    const CRASHING: &str = r#"#!/bin/sh
echo run >> "$(dirname "$0")/runs"
exit 1
"#;

    const IGNORES_TERM: &str = r#"#!/bin/sh
trap '' TERM
echo run >> "$(dirname "$0")/runs"
while true; do sleep 0.1; done
"#;

    const REPORTS_TERM: &str = r#"#!/bin/sh
trap 'echo term >> "$(dirname "$0")/signals"; exit 0' TERM
echo run >> "$(dirname "$0")/runs"
while true; do sleep 0.1; done
"#;

    const CHECKER: &str = r#"#!/bin/sh
if [ "$1" = "check" ]; then
  if grep -q broken "$3"; then
    echo "bad inbound" >&2
    exit 1
  fi
  exit 0
fi
exec sleep 30
"#;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-proxy");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn fast_settings(dir: &Path, script: &str) -> SupervisorSettings {
        let binary = write_script(dir, script);
        let config_path = dir.join("config.json");
        std::fs::write(&config_path, "{}").unwrap();

        SupervisorSettings {
            binary,
            config_path,
            control_addr: free_addr(),
            stats_addr: free_addr(),
            port_wait_timeout: Duration::from_secs(2),
            port_poll_interval: Duration::from_millis(20),
            port_dial_timeout: Duration::from_millis(50),
            stop_grace: Duration::from_millis(500),
            kill_wait: Duration::from_secs(2),
            port_release_pause: Duration::from_millis(10),
            crash_window: Duration::from_secs(10),
            backoff_unit: Duration::from_millis(10),
            max_restarts: 5,
        }
    }

    fn runs(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    async fn wait_for_runs(dir: &Path, expected: usize) {
        for _ in 0..200 {
            if runs(dir) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} runs, saw {}", expected, runs(dir));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(fast_settings(dir.path(), LONG_RUNNING));

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.status().pid.is_some());
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::AlreadyRunning)
        ));
        wait_for_runs(dir.path(), 1).await;

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());

        // Intentional stop never restarts
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs(dir.path()), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_ok() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(fast_settings(dir.path(), LONG_RUNNING));
        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_kills_stubborn_process() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), IGNORES_TERM);
        settings.stop_grace = Duration::from_millis(200);
        let supervisor = Supervisor::new(settings);

        supervisor.start().await.unwrap();
        wait_for_runs(dir.path(), 1).await;
        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_sends_term_through_watcher() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(fast_settings(dir.path(), REPORTS_TERM));

        supervisor.start().await.unwrap();
        wait_for_runs(dir.path(), 1).await;
        supervisor.stop().await.unwrap();

        let signals = std::fs::read_to_string(dir.path().join("signals")).unwrap();
        assert_eq!(signals.trim(), "term");
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_reaped_child_is_not_signalled() {
        let mut child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        child.wait().await.unwrap();
        assert!(!signal_child(&mut child, Signal::Term));
        assert!(!signal_child(&mut child, Signal::Kill));

        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        assert!(signal_child(&mut child, Signal::Term));
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_start_requires_files() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), LONG_RUNNING);
        settings.config_path = dir.path().join("missing.json");
        let supervisor = Supervisor::new(settings);
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::ConfigMissing(_))
        ));

        let mut settings = fast_settings(dir.path(), LONG_RUNNING);
        settings.binary = dir.path().join("no-such-binary");
        let supervisor = Supervisor::new(settings);
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::BinaryMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_start_waits_for_port() {
        let dir = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = fast_settings(dir.path(), LONG_RUNNING);
        settings.control_addr = listener.local_addr().unwrap();
        let supervisor = Supervisor::new(settings);

        let starter = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start().await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs(dir.path()), 0);
        assert!(!supervisor.is_running());

        drop(listener);
        starter.await.unwrap().unwrap();
        assert!(supervisor.is_running());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_port_timeout() {
        let dir = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = fast_settings(dir.path(), LONG_RUNNING);
        settings.control_addr = listener.local_addr().unwrap();
        settings.port_wait_timeout = Duration::from_millis(150);
        let supervisor = Supervisor::new(settings);

        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::PortBusy { .. })
        ));
        assert_eq!(runs(dir.path()), 0);
        drop(listener);
    }

    #[tokio::test]
    async fn test_busy_stats_port_blocks_start() {
        let dir = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = fast_settings(dir.path(), LONG_RUNNING);
        settings.stats_addr = listener.local_addr().unwrap();
        settings.port_wait_timeout = Duration::from_millis(150);
        let supervisor = Supervisor::new(settings);

        match supervisor.start().await {
            Err(SupervisorError::PortBusy { addr, .. }) => {
                assert_eq!(addr, listener.local_addr().unwrap())
            }
            other => panic!("expected PortBusy, got {other:?}"),
        }
        assert_eq!(runs(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_crash_restarts_then_gives_up() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(fast_settings(dir.path(), CRASHING));

        supervisor.start().await.unwrap();
        wait_for_runs(dir.path(), 6).await;

        for _ in 0..200 {
            if supervisor.status().exhausted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = supervisor.status();
        assert!(status.exhausted);
        assert!(!status.running);
        assert_eq!(status.restarts, 5);

        // No further attempts
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs(dir.path()), 6);

        assert!(matches!(
            supervisor.reload().await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), CRASHING);
        settings.backoff_unit = Duration::from_millis(200);
        let supervisor = Supervisor::new(settings);

        supervisor.start().await.unwrap();
        wait_for_runs(dir.path(), 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(runs(dir.path()), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_reload_replaces_instance() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(fast_settings(dir.path(), LONG_RUNNING));

        supervisor.start().await.unwrap();
        let first = supervisor.status();
        supervisor.reload().await.unwrap();
        let second = supervisor.status();

        assert!(second.running);
        assert!(second.generation > first.generation);
        assert_ne!(first.pid, second.pid);

        // The replaced instance's exit must not count as a crash
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = supervisor.status();
        assert_eq!(status.generation, second.generation);
        assert_eq!(status.consecutive_crashes, 0);
        assert_eq!(runs(dir.path()), 2);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_requires_running() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(fast_settings(dir.path(), LONG_RUNNING));
        assert!(matches!(
            supervisor.reload().await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_check_config() {
        let dir = TempDir::new().unwrap();
        let settings = fast_settings(dir.path(), CHECKER);
        let config_path = settings.config_path.clone();
        let supervisor = Supervisor::new(settings);

        supervisor.check_config().await.unwrap();

        std::fs::write(&config_path, "broken").unwrap();
        match supervisor.check_config().await {
            Err(SupervisorError::CheckFailed(msg)) => assert!(msg.contains("bad inbound")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
