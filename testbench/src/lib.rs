use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use seemon::{Bus, MonitorReport, SessionConfig, StopReason, Transport, TransportError};
use serde::Deserialize;

/// Bus backends every scenario is run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Direct,
    I2c,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Direct, Backend::I2c];

    pub fn name(self) -> &'static str {
        match self {
            Backend::Direct => "direct",
            Backend::I2c => "i2c",
        }
    }

    pub fn bus(self) -> Bus {
        match self {
            Backend::Direct => Bus::Direct,
            Backend::I2c => Bus::I2c,
        }
    }
}

/// A session file with the counters the run must end with.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub session: SessionConfig,
    #[serde(default)]
    pub expect: Expectation,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let scenario: Scenario = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        scenario.session.validate()?;
        Ok(scenario)
    }

    /// The session with its bus replaced by `backend`.
    pub fn session_for(&self, backend: Backend) -> SessionConfig {
        SessionConfig {
            bus: backend.bus(),
            ..self.session.clone()
        }
    }
}

/// Report counters to check. Missing keys are not checked.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    pub iterations: Option<u64>,
    pub mismatched_iterations: Option<u64>,
    pub flips: Option<u64>,
    pub flipped_bits: Option<u64>,
    pub read_failures: Option<u64>,
    pub recoveries: Option<u64>,
    pub stop: Option<StopReason>,
}

impl Expectation {
    pub fn check(&self, report: &MonitorReport) -> Result<()> {
        let counters = [
            ("iterations", self.iterations, report.iterations),
            (
                "mismatched_iterations",
                self.mismatched_iterations,
                report.mismatched_iterations,
            ),
            ("flips", self.flips, report.flips),
            ("flipped_bits", self.flipped_bits, report.flipped_bits),
            ("read_failures", self.read_failures, report.read_failures),
            ("recoveries", self.recoveries, report.recoveries),
        ];
        for (name, expected, actual) in counters {
            if let Some(expected) = expected {
                ensure!(
                    expected == actual,
                    "{name}: expected {expected}, got {actual}"
                );
            }
        }
        if let Some(stop) = self.stop {
            ensure!(
                report.stop_reason == Some(stop),
                "stop reason: expected {stop:?}, got {:?}",
                report.stop_reason
            );
        }
        Ok(())
    }
}

/// Transport whose chosen reads fail. Read calls are counted from 1.
pub struct FlakyTransport<T> {
    inner: T,
    failing: BTreeSet<u64>,
    reads: u64,
}

impl<T: Transport> FlakyTransport<T> {
    pub fn new(inner: T, failing: impl IntoIterator<Item = u64>) -> Self {
        Self {
            inner,
            failing: failing.into_iter().collect(),
            reads: 0,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl<T: Transport> Transport for FlakyTransport<T> {
    fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        self.reads += 1;
        if self.failing.contains(&self.reads) {
            return Err(TransportError::Read {
                address,
                reason: format!("injected failure on read {}", self.reads),
            });
        }
        self.inner.read(address)
    }

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        self.inner.write(address, value)
    }
}

/// Transport that answers reads of an address from a queue of values before falling
/// back to the wrapped transport.
pub struct ScriptedTransport<T> {
    inner: T,
    script: HashMap<u16, VecDeque<u8>>,
    writes: u64,
}

impl<T: Transport> ScriptedTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            script: HashMap::new(),
            writes: 0,
        }
    }

    /// Queues `values` as the next observations of `address`.
    pub fn script_reads(&mut self, address: u16, values: impl IntoIterator<Item = u8>) {
        self.script.entry(address).or_default().extend(values);
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl<T: Transport> Transport for ScriptedTransport<T> {
    fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        match self.script.get_mut(&address).and_then(VecDeque::pop_front) {
            Some(value) => Ok(value),
            None => self.inner.read(address),
        }
    }

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        self.writes += 1;
        self.inner.write(address, value)
    }
}
