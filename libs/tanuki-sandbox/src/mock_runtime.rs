// Scripted in-memory container runtime for engine tests
use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, RawOutput, StdinSink, UnitInfo, UnitSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;

/// How every unit created by a [`MockRuntime`] behaves
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub exit_code: i64,
    /// Time until the unit exits on its own (ignored with `echo_stdin`)
    pub run_for: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit 0 once stdin is closed, printing what was received
    pub echo_stdin: bool,
    pub kill_failures: u32,
    pub remove_failures: u32,
    /// How long each `remove` call takes before it does anything
    pub remove_delay: Duration,
    pub fail_create: bool,
    pub fail_start: bool,
    pub image_present: bool,
}

#[derive(Debug, Default)]
struct Unit {
    spec: Option<UnitSpec>,
    labels: HashMap<String, String>,
    started_at: Option<Instant>,
    exit_code: Option<i64>,
    stdin: Vec<u8>,
    stdin_closed: bool,
    removed: bool,
    remove_calls: usize,
}

#[derive(Debug, Default)]
struct State {
    units: HashMap<String, Unit>,
    events: Vec<String>,
    kill_failures_left: u32,
    remove_failures_left: u32,
    builds: usize,
}

#[derive(Debug)]
pub struct MockRuntime {
    behavior: MockBehavior,
    state: Arc<Mutex<State>>,
    next_id: AtomicUsize,
    kill_calls: AtomicUsize,
}

impl MockRuntime {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        let state = State {
            kill_failures_left: behavior.kill_failures,
            remove_failures_left: behavior.remove_failures,
            ..Default::default()
        };
        Arc::new(Self {
            behavior,
            state: Arc::new(Mutex::new(state)),
            next_id: AtomicUsize::new(1),
            kill_calls: AtomicUsize::new(0),
        })
    }

    /// Create and start an unlabelled unit directly, bypassing `create`
    pub fn spawn_unit(&self) -> String {
        self.spawn_labelled(HashMap::new())
    }

    /// Create and start a unit carrying `labels`, bypassing `create`
    pub fn spawn_labelled(&self, labels: HashMap<String, String>) -> String {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let unit = Unit {
            labels,
            started_at: Some(Instant::now()),
            ..Default::default()
        };
        self.state.lock().unwrap().units.insert(id.clone(), unit);
        id
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    pub fn builds(&self) -> usize {
        self.state.lock().unwrap().builds
    }

    /// How often `remove` was called for each unit id
    pub fn remove_calls(&self) -> HashMap<String, usize> {
        let state = self.state.lock().unwrap();
        state
            .units
            .iter()
            .map(|(id, unit)| (id.clone(), unit.remove_calls))
            .collect()
    }

    pub fn specs(&self) -> Vec<UnitSpec> {
        let state = self.state.lock().unwrap();
        state.units.values().filter_map(|u| u.spec.clone()).collect()
    }

    /// Ordered `"<operation> <id>"` log of runtime calls
    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    fn record(&self, state: &mut State, event: &str, id: &str) {
        state.events.push(format!("{} {}", event, id));
    }

    fn live_unit<'a>(state: &'a mut State, id: &str) -> Result<&'a mut Unit, RuntimeError> {
        match state.units.get_mut(id) {
            Some(unit) if !unit.removed => Ok(unit),
            _ => Err(RuntimeError::Other(format!("no such container: {}", id))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(self.behavior.image_present || state.builds > 0)
    }

    async fn build_image(
        &self,
        _context: &Path,
        _dockerfile: &Path,
        _tag: &str,
        _no_cache: bool,
    ) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().builds += 1;
        Ok(())
    }

    async fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError> {
        if self.behavior.fail_create {
            return Err(RuntimeError::Other(format!("No such image: {}", spec.image)));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "create", &id);
        state.units.insert(
            id.clone(),
            Unit {
                spec: Some(spec.clone()),
                labels: spec.labels.clone(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn attach_stdin(&self, id: &str) -> Result<StdinSink, RuntimeError> {
        {
            let mut state = self.state.lock().unwrap();
            Self::live_unit(&mut state, id)?;
            self.record(&mut state, "attach", id);
        }

        let (writer, mut reader) = tokio::io::duplex(4096);
        let shared = Arc::clone(&self.state);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut received = Vec::new();
            let _ = reader.read_to_end(&mut received).await;
            let mut state = shared.lock().unwrap();
            if let Some(unit) = state.units.get_mut(&id) {
                unit.stdin = received;
                unit.stdin_closed = true;
            }
        });

        Ok(Box::pin(writer))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        if self.behavior.fail_start {
            return Err(RuntimeError::Other("cpu quota rejected".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "start", id);
        Self::live_unit(&mut state, id)?.started_at = Some(Instant::now());
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let unit = Self::live_unit(&mut state, id)?;
                if let Some(code) = unit.exit_code {
                    return Ok(code);
                }
                let finished = if self.behavior.echo_stdin {
                    unit.stdin_closed
                } else {
                    unit.started_at
                        .map(|t| t.elapsed() >= self.behavior.run_for)
                        .unwrap_or(false)
                };
                if finished {
                    unit.exit_code = Some(self.behavior.exit_code);
                    return Ok(self.behavior.exit_code);
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn logs(&self, id: &str) -> Result<RawOutput, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "logs", id);
        let unit = Self::live_unit(&mut state, id)?;
        let stdout = if self.behavior.echo_stdin {
            unit.stdin.clone()
        } else {
            self.behavior.stdout.clone()
        };
        Ok(RawOutput {
            stdout,
            stderr: self.behavior.stderr.clone(),
        })
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "kill", id);
        if state.kill_failures_left > 0 {
            state.kill_failures_left -= 1;
            return Err(RuntimeError::Other("kill rejected".to_string()));
        }
        let unit = Self::live_unit(&mut state, id)?;
        if unit.exit_code.is_none() {
            unit.exit_code = Some(137);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        if !self.behavior.remove_delay.is_zero() {
            tokio::time::sleep(self.behavior.remove_delay).await;
        }
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "remove", id);
        if let Some(unit) = state.units.get_mut(id) {
            unit.remove_calls += 1;
        }
        if state.remove_failures_left > 0 {
            state.remove_failures_left -= 1;
            return Err(RuntimeError::Other("removal in progress".to_string()));
        }
        let unit = Self::live_unit(&mut state, id)?;
        unit.removed = true;
        if unit.exit_code.is_none() {
            unit.exit_code = Some(137);
        }
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<UnitInfo>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .units
            .iter()
            .filter(|(_, unit)| !unit.removed)
            .map(|(id, unit)| UnitInfo {
                id: id.clone(),
                labels: unit.labels.clone(),
            })
            .collect())
    }
}
