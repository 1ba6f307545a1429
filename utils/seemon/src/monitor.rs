//! Bit-flip monitor.
//!
//! The monitor repeatedly reads a set of registers through a [`Probe`], compares
//! every byte against the reference the probe was written with, reports each
//! differing byte as a [`BitFlip`] and runs the configured [`Recovery`] operations.
//! The reference never follows the observed values, so a persistent upset keeps
//! being reported until something rewrites the register.
//!
//! The loop has no stop condition of its own. It ends when its [`CancelToken`] is
//! cancelled, when an optional iteration limit is reached, or (if asked to) at the
//! first mismatch.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use serde::Deserialize;

use crate::chip::Chip;
use crate::regmap::{Image, RegisterStore};
use crate::register_file::DEFAULT_FLIP_PROBABILITY;
use crate::snapshot::Snapshot;
use crate::transport::{Transport, TransportError};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Pause before every read. A lower bound, drift is not compensated.
    pub interval: Duration,
    /// Inject fake single-bit flips into the values read during monitoring.
    pub simulate_flip: bool,
    pub flip_probability: f64,
    pub max_iterations: Option<u64>,
    /// End the run at the first mismatching iteration, before recovery.
    pub stop_on_mismatch: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            simulate_flip: false,
            flip_probability: DEFAULT_FLIP_PROBABILITY,
            max_iterations: None,
            stop_on_mismatch: false,
        }
    }
}

/// Shared flag that stops a running monitor at the next iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Cancelled,
    IterationLimit,
    Mismatch,
}

/// One register byte that no longer holds its reference value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitFlip {
    pub iteration: u64,
    pub probe: String,
    pub address: u16,
    pub field: Option<String>,
    pub expected: u8,
    pub observed: u8,
}

impl BitFlip {
    pub fn diff(&self) -> u8 {
        self.expected ^ self.observed
    }

    /// Positions (0 = LSB) of the bits that differ.
    pub fn flipped_bits(&self) -> impl Iterator<Item = u32> + use<> {
        let diff = self.diff();
        (0..8).filter(move |&bit| diff & (1 << bit) != 0)
    }

    pub fn bit_count(&self) -> u32 {
        self.diff().count_ones()
    }

    pub fn is_single_bit(&self) -> bool {
        self.bit_count() == 1
    }
}

impl fmt::Display for BitFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.address)?;
        if let Some(field) = &self.field {
            write!(f, " ({field})")?;
        }
        let bits: Vec<String> = self.flipped_bits().map(|bit| bit.to_string()).collect();
        write!(
            f,
            ": expected 0x{:02x}, observed 0x{:02x}, bits [{}]",
            self.expected,
            self.observed,
            bits.join(",")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Started {
        probe: String,
        cells: usize,
        ones: u32,
    },
    /// Hex dump of a mismatching iteration, recorded once before its [`BitFlip`] events.
    /// It is a summary for logging: the discrepancy notifications are the
    /// [`MonitorEvent::BitFlip`] events, one per differing byte.
    Mismatch {
        iteration: u64,
        probe: String,
        expected: Snapshot,
        observed: Snapshot,
    },
    BitFlip(BitFlip),
    ReadFailed {
        iteration: u64,
        error: String,
    },
    Recovered {
        iteration: u64,
        recovery: String,
    },
    RecoveryFailed {
        iteration: u64,
        recovery: String,
        error: String,
    },
    Stopped {
        iterations: u64,
        reason: StopReason,
    },
}

/// Receives everything the monitor observes.
pub trait EventSink {
    fn record(&mut self, event: &MonitorEvent);
}

impl EventSink for Vec<MonitorEvent> {
    fn record(&mut self, event: &MonitorEvent) {
        self.push(event.clone());
    }
}

/// Writes events to the `log` facade as tab separated lines: an `old` / `new` hex dump
/// pair per mismatching iteration and one line per flipped byte.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&mut self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Started { probe, cells, ones } => {
                info!("monitoring {probe}: {cells} bytes, {ones} bits set")
            }
            MonitorEvent::Mismatch {
                iteration,
                probe,
                expected,
                observed,
            } => {
                warn!("{iteration}\t{probe}\t{}\told\t{expected}", expected.ones());
                warn!("{iteration}\t{probe}\t{}\tnew\t{observed}", observed.ones());
            }
            MonitorEvent::BitFlip(flip) => warn!(
                "{}\t{}\t{}\t{:02x}\t{:02x}\t{}",
                flip.iteration,
                flip.probe,
                flip.field.as_deref().unwrap_or("-"),
                flip.expected,
                flip.observed,
                flip
            ),
            MonitorEvent::ReadFailed { iteration, error } => {
                error!("{iteration}\tread failed: {error}")
            }
            MonitorEvent::Recovered {
                iteration,
                recovery,
            } => info!("{iteration}\t{recovery} done"),
            MonitorEvent::RecoveryFailed {
                iteration,
                recovery,
                error,
            } => error!("{iteration}\t{recovery} failed: {error}"),
            MonitorEvent::Stopped { iterations, reason } => {
                info!("stopped after {iterations} iterations ({reason:?})")
            }
        }
    }
}

/// The read operation the monitor polls.
pub trait Probe<T> {
    fn label(&self) -> &str;

    /// Values the registers are expected to hold.
    fn reference(&self) -> Snapshot;

    fn field_name(&self, _address: u16) -> Option<&str> {
        None
    }

    fn read(&mut self, chip: &mut Chip<T>) -> Result<Snapshot, TransportError>;
}

/// An operation run after a mismatch, typically rewriting registers.
pub trait Recovery<T> {
    fn label(&self) -> &str;

    fn recover(&mut self, chip: &mut Chip<T>) -> crate::Result<()>;
}

/// Reads back the registers of an [`Image`]; the image contents are the reference.
pub struct ImageProbe<I> {
    image: I,
}

impl<I: Image> ImageProbe<I> {
    pub fn new(image: I) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &I {
        &self.image
    }
}

impl<T: Transport, I: Image> Probe<T> for ImageProbe<I> {
    fn label(&self) -> &str {
        self.image.label()
    }

    fn reference(&self) -> Snapshot {
        Snapshot::of_image(&self.image)
    }

    fn field_name(&self, address: u16) -> Option<&str> {
        self.image.field_name(address)
    }

    fn read(&mut self, chip: &mut Chip<T>) -> Result<Snapshot, TransportError> {
        chip.read_image(&self.image)
    }
}

/// Rewrites an [`Image`].
pub struct ImageWrite<I> {
    label: String,
    image: I,
}

impl<I: Image> ImageWrite<I> {
    pub fn new(image: I) -> Self {
        Self {
            label: format!("write {}", image.label()),
            image,
        }
    }
}

impl<T: Transport, I: Image> Recovery<T> for ImageWrite<I> {
    fn label(&self) -> &str {
        &self.label
    }

    fn recover(&mut self, chip: &mut Chip<T>) -> crate::Result<()> {
        chip.write_image(&self.image)?;
        Ok(())
    }
}

/// Rewrites the general configuration and the DAC registers together.
pub struct UpdateRegisters {
    gen_conf: RegisterStore,
    dac: RegisterStore,
}

impl UpdateRegisters {
    pub fn new(gen_conf: RegisterStore, dac: RegisterStore) -> Self {
        Self { gen_conf, dac }
    }
}

impl<T: Transport> Recovery<T> for UpdateRegisters {
    fn label(&self) -> &str {
        "update registers"
    }

    fn recover(&mut self, chip: &mut Chip<T>) -> crate::Result<()> {
        chip.write_image(&self.gen_conf)?;
        chip.write_image(&self.dac)?;
        Ok(())
    }
}

/// Probe backed by a closure and a fixed reference.
pub struct FnProbe<F> {
    label: String,
    reference: Snapshot,
    read: F,
}

impl<F> FnProbe<F> {
    pub fn new(label: impl Into<String>, reference: Snapshot, read: F) -> Self {
        Self {
            label: label.into(),
            reference,
            read,
        }
    }
}

impl<T, F> Probe<T> for FnProbe<F>
where
    F: FnMut(&mut Chip<T>) -> Result<Snapshot, TransportError>,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn reference(&self) -> Snapshot {
        self.reference.clone()
    }

    fn read(&mut self, chip: &mut Chip<T>) -> Result<Snapshot, TransportError> {
        (self.read)(chip)
    }
}

/// Recovery backed by a closure.
pub struct FnRecovery<F> {
    label: String,
    recover: F,
}

impl<F> FnRecovery<F> {
    pub fn new(label: impl Into<String>, recover: F) -> Self {
        Self {
            label: label.into(),
            recover,
        }
    }
}

impl<T, F> Recovery<T> for FnRecovery<F>
where
    F: FnMut(&mut Chip<T>) -> crate::Result<()>,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn recover(&mut self, chip: &mut Chip<T>) -> crate::Result<()> {
        (self.recover)(chip)
    }
}

/// Counters of a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub iterations: u64,
    /// Iterations in which at least one byte differed.
    pub mismatched_iterations: u64,
    /// Differing bytes over all iterations.
    pub flips: u64,
    pub flipped_bits: u64,
    pub read_failures: u64,
    pub recoveries: u64,
    pub recovery_failures: u64,
    /// Reference and observation of the last mismatching iteration.
    pub last_mismatch: Option<(Snapshot, Snapshot)>,
    pub stop_reason: Option<StopReason>,
}

pub struct BitFlipMonitor {
    config: MonitorConfig,
    cancel: CancelToken,
    state: MonitorState,
}

impl BitFlipMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            state: MonitorState::Idle,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Token that stops [`start`](Self::start) from another thread or from inside a
    /// probe. Once cancelled it stays cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the sleep / read / compare / recover cycle on the calling thread until the
    /// run is stopped. Transport failures and mismatches are reported to `sink`,
    /// never returned.
    pub fn start<T: Transport>(
        &mut self,
        chip: &mut Chip<T>,
        probe: &mut dyn Probe<T>,
        recoveries: &mut [Box<dyn Recovery<T>>],
        sink: &mut dyn EventSink,
    ) -> MonitorReport {
        let reference = probe.reference();
        let previous_flips = chip.flip_simulation();
        if self.config.simulate_flip {
            chip.set_flip_simulation(Some(self.config.flip_probability));
        }

        self.state = MonitorState::Running;
        sink.record(&MonitorEvent::Started {
            probe: probe.label().to_owned(),
            cells: reference.len(),
            ones: reference.ones(),
        });

        let mut report = MonitorReport::default();
        let reason = loop {
            if let Some(reason) = self.should_stop(&report) {
                break reason;
            }
            if !self.config.interval.is_zero() {
                thread::sleep(self.config.interval);
                if self.cancel.is_cancelled() {
                    break StopReason::Cancelled;
                }
            }

            report.iterations += 1;
            let iteration = report.iterations;

            let observed = match probe.read(chip) {
                Ok(observed) => observed,
                Err(err) => {
                    report.read_failures += 1;
                    sink.record(&MonitorEvent::ReadFailed {
                        iteration,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let diffs = match reference.diff(&observed) {
                Ok(diffs) => diffs,
                Err(err) => {
                    report.read_failures += 1;
                    sink.record(&MonitorEvent::ReadFailed {
                        iteration,
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            if diffs.is_empty() {
                continue;
            }

            report.mismatched_iterations += 1;
            sink.record(&MonitorEvent::Mismatch {
                iteration,
                probe: probe.label().to_owned(),
                expected: reference.clone(),
                observed: observed.clone(),
            });
            for (address, expected, value) in diffs {
                let flip = BitFlip {
                    iteration,
                    probe: probe.label().to_owned(),
                    address,
                    field: probe.field_name(address).map(str::to_owned),
                    expected,
                    observed: value,
                };
                report.flips += 1;
                report.flipped_bits += flip.bit_count() as u64;
                sink.record(&MonitorEvent::BitFlip(flip));
            }
            report.last_mismatch = Some((reference.clone(), observed));

            if self.config.stop_on_mismatch {
                break StopReason::Mismatch;
            }

            for recovery in recoveries.iter_mut() {
                match recovery.recover(chip) {
                    Ok(()) => {
                        report.recoveries += 1;
                        sink.record(&MonitorEvent::Recovered {
                            iteration,
                            recovery: recovery.label().to_owned(),
                        });
                    }
                    Err(err) => {
                        report.recovery_failures += 1;
                        sink.record(&MonitorEvent::RecoveryFailed {
                            iteration,
                            recovery: recovery.label().to_owned(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        };

        chip.set_flip_simulation(previous_flips);
        self.state = MonitorState::Stopped;
        report.stop_reason = Some(reason);
        sink.record(&MonitorEvent::Stopped {
            iterations: report.iterations,
            reason,
        });
        report
    }

    fn should_stop(&self, report: &MonitorReport) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.config.max_iterations {
            Some(limit) if report.iterations >= limit => Some(StopReason::IterationLimit),
            _ => None,
        }
    }
}
