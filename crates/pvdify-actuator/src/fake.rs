//! In-memory collaborators for tests.
//!
//! Each fake records what it was asked to do and can be told to fail an
//! operation, either every time or a fixed number of times.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ActuatorError, ActuatorResult};
use crate::exec::CommandOutput;
use crate::traits::*;

/// Remaining injected failures per operation name. `None` = fail forever.
#[derive(Debug, Default)]
struct Failures(HashMap<String, Option<u32>>);

impl Failures {
    fn check(&mut self, op: &str) -> ActuatorResult<()> {
        match self.0.get(op).copied() {
            None => return Ok(()),
            Some(Some(0)) => {
                self.0.remove(op);
                return Ok(());
            }
            Some(Some(n)) => {
                self.0.insert(op.to_string(), Some(n - 1));
            }
            Some(None) => {}
        }
        Err(ActuatorError::CommandFailed {
            command: format!("fake {op}"),
            exit_code: 1,
            stdout: String::new(),
            stderr: format!("injected {op} failure"),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ── Supervisor ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SupervisorState {
    unit_files: BTreeMap<String, String>,
    running: BTreeMap<String, BTreeSet<u32>>,
    enabled: BTreeSet<String>,
    calls: Vec<String>,
    reloads: u32,
    failures: Failures,
}

/// Supervisor that tracks unit files and running instances in memory.
#[derive(Debug, Clone, Default)]
pub struct FakeSupervisor {
    state: Arc<Mutex<SupervisorState>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call of `op` (e.g. `"start"`) until cleared.
    pub fn fail_always(&self, op: &str) {
        lock(&self.state).failures.0.insert(op.to_string(), None);
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_times(&self, op: &str, times: u32) {
        lock(&self.state).failures.0.insert(op.to_string(), Some(times));
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.0.clear();
    }

    /// Running instance indices of a template base name.
    pub fn running(&self, unit: &str) -> Vec<u32> {
        lock(&self.state)
            .running
            .get(unit)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mark an instance as running without going through `start`.
    pub fn set_running(&self, unit: &str, index: u32) {
        lock(&self.state)
            .running
            .entry(unit.to_string())
            .or_default()
            .insert(index);
    }

    pub fn unit_file(&self, file_name: &str) -> Option<String> {
        lock(&self.state).unit_files.get(file_name).cloned()
    }

    pub fn unit_files(&self) -> Vec<String> {
        lock(&self.state).unit_files.keys().cloned().collect()
    }

    pub fn is_enabled(&self, unit: &str, index: u32) -> bool {
        lock(&self.state).enabled.contains(&format!("{unit}@{index}"))
    }

    pub fn reloads(&self) -> u32 {
        lock(&self.state).reloads
    }

    /// Every call in order, as `"<op> <target>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, op: &str, target: &str) -> ActuatorResult<MutexGuard<'_, SupervisorState>> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{op} {target}"));
        state.failures.check(op)?;
        Ok(state)
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn install_unit(&self, file_name: &str, contents: &str) -> ActuatorResult<()> {
        let mut state = self.record("install_unit", file_name)?;
        state
            .unit_files
            .insert(file_name.to_string(), contents.to_string());
        Ok(())
    }

    async fn remove_unit(&self, file_name: &str) -> ActuatorResult<()> {
        let mut state = self.record("remove_unit", file_name)?;
        state.unit_files.remove(file_name);
        Ok(())
    }

    async fn daemon_reload(&self) -> ActuatorResult<()> {
        let mut state = self.record("daemon_reload", "")?;
        state.reloads += 1;
        Ok(())
    }

    async fn start(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        let mut state = self.record("start", &format!("{unit}@{index}"))?;
        state.running.entry(unit.to_string()).or_default().insert(index);
        Ok(())
    }

    async fn stop(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        let mut state = self.record("stop", &format!("{unit}@{index}"))?;
        if let Some(set) = state.running.get_mut(unit) {
            set.remove(&index);
        }
        Ok(())
    }

    async fn restart(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        let mut state = self.record("restart", &format!("{unit}@{index}"))?;
        state.running.entry(unit.to_string()).or_default().insert(index);
        Ok(())
    }

    async fn enable(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        let name = format!("{unit}@{index}");
        let mut state = self.record("enable", &name)?;
        state.enabled.insert(name);
        Ok(())
    }

    async fn disable(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        let name = format!("{unit}@{index}");
        let mut state = self.record("disable", &name)?;
        state.enabled.remove(&name);
        Ok(())
    }

    async fn status(&self, unit: &str, index: u32) -> ActuatorResult<UnitStatus> {
        let state = self.record("status", &format!("{unit}@{index}"))?;
        let running = state
            .running
            .get(unit)
            .is_some_and(|s| s.contains(&index));
        Ok(if running {
            UnitStatus {
                active: "active".to_string(),
                sub_state: "running".to_string(),
                pid: 1000 + index,
                memory: "32.0M".to_string(),
                load_state: "loaded".to_string(),
            }
        } else {
            UnitStatus {
                active: "inactive".to_string(),
                sub_state: "dead".to_string(),
                pid: 0,
                memory: "[not set]".to_string(),
                load_state: "loaded".to_string(),
            }
        })
    }

    async fn list_instances(&self, unit: &str) -> ActuatorResult<Vec<u32>> {
        let state = self.record("list_instances", unit)?;
        Ok(state
            .running
            .get(unit)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }
}

// ── Container runtime ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct RuntimeState {
    images: BTreeSet<String>,
    pulls: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
    execs: Vec<(String, Vec<String>)>,
    exec_output: CommandOutput,
    failures: Failures,
}

#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_always(&self, op: &str) {
        lock(&self.state).failures.0.insert(op.to_string(), None);
    }

    pub fn fail_times(&self, op: &str, times: u32) {
        lock(&self.state).failures.0.insert(op.to_string(), Some(times));
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.0.clear();
    }

    /// Output returned by the next `exec` calls.
    pub fn set_exec_output(&self, output: CommandOutput) {
        lock(&self.state).exec_output = output;
    }

    pub fn pulls(&self) -> Vec<String> {
        lock(&self.state).pulls.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        lock(&self.state).stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        lock(&self.state).removed.clone()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.state).execs.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str) -> ActuatorResult<()> {
        let mut state = lock(&self.state);
        state.failures.check("pull")?;
        state.pulls.push(image.to_string());
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn exists(&self, image: &str) -> ActuatorResult<bool> {
        let mut state = lock(&self.state);
        state.failures.check("exists")?;
        Ok(state.images.contains(image))
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> ActuatorResult<()> {
        let mut state = lock(&self.state);
        state.failures.check("stop")?;
        state.stopped.push(name.to_string());
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> ActuatorResult<()> {
        let mut state = lock(&self.state);
        state.failures.check("remove")?;
        state.removed.push(name.to_string());
        Ok(())
    }

    async fn stats(&self, _name: &str) -> ActuatorResult<ContainerStats> {
        let mut state = lock(&self.state);
        state.failures.check("stats")?;
        Ok(ContainerStats {
            cpu_percent: 0.5,
            memory: "32MB".to_string(),
        })
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> ActuatorResult<CommandOutput> {
        let mut state = lock(&self.state);
        state.failures.check("exec")?;
        state.execs.push((name.to_string(), cmd.to_vec()));
        Ok(state.exec_output.clone())
    }
}

// ── Log source ─────────────────────────────────────────────────────

/// Emits canned lines; following streams then stay open until dropped.
/// Lines pushed for a unit are only emitted when a selector matches it.
#[derive(Debug, Clone, Default)]
pub struct FakeLogSource {
    lines: Arc<Mutex<Vec<(Option<String>, String)>>>,
    queries: Arc<Mutex<Vec<LogQuery>>>,
    open: Arc<AtomicUsize>,
}

struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeLogSource {
    pub fn new(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            lines: Arc::new(Mutex::new(lines.into_iter().map(|l| (None, l.into())).collect())),
            ..Default::default()
        }
    }

    /// Append a line logged by `unit`, e.g. `pvdify-shop-web@1`.
    pub fn push_unit_line(&self, unit: &str, line: &str) {
        lock(&self.lines).push((Some(unit.to_string()), line.to_string()));
    }

    /// Streams not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<LogQuery> {
        lock(&self.queries).clone()
    }
}

/// Shell-style match where `*` is the only wildcard.
fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((head, tail)) => {
            let Some(rest) = name.strip_prefix(head) else {
                return false;
            };
            (0..=rest.len())
                .filter(|i| rest.is_char_boundary(*i))
                .any(|i| glob_match(tail, &rest[i..]))
        }
    }
}

#[async_trait]
impl LogSource for FakeLogSource {
    async fn stream(&self, query: &LogQuery) -> ActuatorResult<LogStream> {
        lock(&self.queries).push(query.clone());
        let all: Vec<String> = lock(&self.lines)
            .iter()
            .filter(|(unit, _)| match unit {
                None => true,
                Some(unit) => query.selectors.iter().any(|s| glob_match(s, unit)),
            })
            .map(|(_, line)| line.clone())
            .collect();
        let skip = all.len().saturating_sub(query.lines as usize);
        let lines: Vec<String> = all.into_iter().skip(skip).collect();
        let follow = query.follow;
        let guard = OpenGuard::new(&self.open);

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for line in lines {
                yield Ok(line);
            }
            if follow {
                futures::future::pending::<()>().await;
            }
        }))
    }
}
