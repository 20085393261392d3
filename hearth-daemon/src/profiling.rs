//! Optional profiling hooks selected by environment variables.
//!
//! - `HEARTH_CPUPROFILE=<path>`: wall-clock profile of the service run.
//! - `HEARTH_SVCTRACE=<path>`: JSON execution trace of every span and event
//!   (installed by [`crate::logging`]).
//! - `HEARTH_MEMPROFILE=<path>`: heap snapshot written at shutdown.
//!
//! Profiles are JSON summaries. Failure to write one is logged and never
//! affects the service.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{io_err, DaemonError};
use crate::guard::lock;

pub const ENV_CPUPROFILE: &str = "HEARTH_CPUPROFILE";
pub const ENV_SVCTRACE: &str = "HEARTH_SVCTRACE";
pub const ENV_MEMPROFILE: &str = "HEARTH_MEMPROFILE";

#[derive(Debug, Serialize)]
struct CpuProfile {
    kind: &'static str,
    pid: u32,
    started_at: DateTime<Utc>,
    stopped_at: DateTime<Utc>,
    wall_ms: u64,
    parallelism: usize,
}

#[derive(Debug, Serialize)]
struct HeapProfile {
    kind: &'static str,
    pid: u32,
    taken_at: DateTime<Utc>,
    resident_kb: Option<u64>,
}

struct CpuSession {
    path: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
}

#[derive(Default)]
pub struct Profiler {
    cpu: Option<PathBuf>,
    trace: Option<PathBuf>,
    mem: Option<PathBuf>,
    session: Mutex<Option<CpuSession>>,
}

impl Profiler {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |var: &str| lookup(var).filter(|v| !v.trim().is_empty()).map(PathBuf::from);
        Self {
            cpu: path(ENV_CPUPROFILE),
            trace: path(ENV_SVCTRACE),
            mem: path(ENV_MEMPROFILE),
            session: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if let Some(path) = &self.cpu {
            tracing::debug!(path = %path.display(), "starting cpu profile");
            *lock(&self.session) = Some(CpuSession {
                path: path.clone(),
                started_at: Utc::now(),
                started: Instant::now(),
            });
        }
        if let Some(path) = &self.trace {
            tracing::debug!(path = %path.display(), "service execution trace enabled");
        }
    }

    /// Finish the cpu profile and take the heap snapshot. Safe to call twice.
    pub fn stop(&self) {
        if let Some(session) = lock(&self.session).take() {
            tracing::debug!(path = %session.path.display(), "stopping cpu profile");
            let profile = CpuProfile {
                kind: "cpu",
                pid: std::process::id(),
                started_at: session.started_at,
                stopped_at: Utc::now(),
                wall_ms: session.started.elapsed().as_millis() as u64,
                parallelism: std::thread::available_parallelism().map_or(1, |n| n.get()),
            };
            report(write_json(&session.path, &profile));
        }
        if let Some(path) = &self.trace {
            tracing::debug!(path = %path.display(), "stopping service execution trace");
        }
        if let Some(path) = &self.mem {
            tracing::debug!(path = %path.display(), "writing heap profile");
            let profile = HeapProfile {
                kind: "heap",
                pid: std::process::id(),
                taken_at: Utc::now(),
                resident_kb: resident_kb(),
            };
            report(write_json(path, &profile));
        }
    }

    pub fn trace_path(&self) -> Option<&Path> {
        self.trace.as_deref()
    }
}

fn report(result: Result<(), DaemonError>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to write profile");
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DaemonError> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|e| io_err(path, e))
}

/// Resident set size from `/proc/self/status`, where available.
fn resident_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_cpu_and_heap_profiles_on_stop() {
        let tmp = TempDir::new().unwrap();
        let cpu = tmp.path().join("cpu.json");
        let mem = tmp.path().join("mem.json");
        let vars: HashMap<&str, String> = [
            (ENV_CPUPROFILE, cpu.display().to_string()),
            (ENV_MEMPROFILE, mem.display().to_string()),
        ]
        .into_iter()
        .collect();
        let profiler = Profiler::from_lookup(|var| vars.get(var).cloned());

        profiler.start();
        profiler.stop();
        profiler.stop();

        let cpu_json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&cpu).unwrap()).unwrap();
        assert_eq!(cpu_json["kind"], "cpu");
        let mem_json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&mem).unwrap()).unwrap();
        assert_eq!(mem_json["kind"], "heap");
    }

    #[test]
    fn blank_values_disable_profiling() {
        let profiler = Profiler::from_lookup(|_| Some(" ".to_string()));
        assert!(profiler.trace_path().is_none());
        profiler.start();
        profiler.stop();
    }
}
