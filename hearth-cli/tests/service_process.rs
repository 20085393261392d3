use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn hearth_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_hearth"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("HEARTH_PUSH_DISABLED", "1")
        .env_remove("HEARTH_RUN_DIR")
        .env_remove("HEARTH_SOCKET_FILE");
    cmd
}

struct ServiceProcess {
    child: Child,
}

impl ServiceProcess {
    fn start(home: &Path) -> Self {
        let child = hearth_cmd(home)
            .args(["service", "--auto-forked"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn service");
        Self { child }
    }

    fn wait_exit(&mut self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return status.code();
            }
            sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn service_running(home: &Path) -> bool {
    let Ok(output) = hearth_cmd(home).args(["status", "--json"]).output() else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&output.stdout) else {
        return false;
    };
    value
        .get("running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn status_reports_stopped_service() {
    let home = TempDir::new().expect("home");
    hearth_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}

#[test]
fn restart_request_sets_exit_code() {
    let home = TempDir::new().expect("home");
    let mut service = ServiceProcess::start(home.path());
    assert!(
        wait_until(Duration::from_secs(10), || service_running(home.path())),
        "service never reported running"
    );

    hearth_cmd(home.path())
        .args(["call", "debugging.echo", "{\"hello\":\"hearth\"}"])
        .assert()
        .success()
        .stdout(contains("hearth"));

    hearth_cmd(home.path())
        .args(["ctl", "stop", "--restart"])
        .assert()
        .success()
        .stdout(contains("stop requested"));

    assert_eq!(service.wait_exit(Duration::from_secs(10)), Some(4));
}
