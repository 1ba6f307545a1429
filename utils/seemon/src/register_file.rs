use log::trace;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::transport::{Transport, TransportError};

/// Probability of a simulated upset per read when none is configured.
pub const DEFAULT_FLIP_PROBABILITY: f64 = 0.001;

/// Number of addressable registers (16-bit address space).
pub const REGISTER_SPACE: usize = 1 << 16;

/// Deterministic single-bit corruption of observed values.
///
/// Given the same seed, the sequence of flip decisions and flipped bit positions is
/// reproducible.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    rng: ChaCha8Rng,
    injected: u64,
}

impl FaultInjector {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            injected: 0,
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_entropy(),
            injected: 0,
        }
    }

    /// Returns `value` with one random bit flipped, with the given probability.
    ///
    /// The probability is clamped to `0.0..=1.0`; NaN never flips.
    pub fn corrupt(&mut self, value: u8, probability: f64) -> u8 {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        if !self.rng.gen_bool(probability) {
            return value;
        }
        let bit = self.rng.gen_range(0..8u32);
        self.injected += 1;
        value ^ (1 << bit)
    }

    /// Number of flips injected so far.
    pub fn injected(&self) -> u64 {
        self.injected
    }
}

/// In-memory register file standing in for the chip.
///
/// Writes always succeed. [`read_observed`](Self::read_observed) may report a corrupted
/// value, but the stored byte is never changed by a read. Reads through [`Transport`]
/// return the stored byte; flip simulation on the transport path belongs to
/// [`Chip`](crate::chip::Chip).
#[derive(Debug, Clone)]
pub struct SimulatedRegisterFile {
    regs: Vec<u8>,
    injector: FaultInjector,
}

impl SimulatedRegisterFile {
    /// All registers zero, which is not the reset state of a real chip.
    pub fn new() -> Self {
        Self::with_injector(FaultInjector::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_injector(FaultInjector::seeded(seed))
    }

    pub fn with_injector(injector: FaultInjector) -> Self {
        Self {
            regs: vec![0; REGISTER_SPACE],
            injector,
        }
    }

    /// Stored value, bypassing fault injection.
    pub fn get(&self, address: u16) -> u8 {
        self.regs[address as usize]
    }

    pub fn set(&mut self, address: u16, value: u8) {
        self.regs[address as usize] = value;
    }

    /// Reads `address`; with `simulate_flip`, one bit of the returned value is flipped
    /// with probability `flip_probability`.
    pub fn read_observed(&mut self, address: u16, simulate_flip: bool, flip_probability: f64) -> u8 {
        let stored = self.get(address);
        if !simulate_flip {
            return stored;
        }
        let observed = self.injector.corrupt(stored, flip_probability);
        if observed != stored {
            trace!("simulated upset at 0x{address:04x}: 0x{stored:02x} -> 0x{observed:02x}");
        }
        observed
    }

    /// Corrupts the stored byte itself, modelling a persistent upset.
    pub fn upset(&mut self, address: u16, mask: u8) {
        self.regs[address as usize] ^= mask;
    }

    /// Clears every register to zero.
    pub fn reset(&mut self) {
        self.regs.fill(0);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.regs
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }
}

impl Default for SimulatedRegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedRegisterFile {
    fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        Ok(self.get(address))
    }

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        self.set(address, value);
        Ok(())
    }
}
