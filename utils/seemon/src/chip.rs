use log::{debug, trace};

use crate::layout;
use crate::regmap::{Image, RegisterStore};
use crate::register_file::FaultInjector;
use crate::snapshot::Snapshot;
use crate::transport::{Transport, TransportError};

/// Driver for one chip behind a [`Transport`].
///
/// All register traffic of a monitoring session goes through here, so read-side flip
/// simulation applies the same way whether the transport is real or simulated.
pub struct Chip<T> {
    transport: T,
    injector: FaultInjector,
    flip_probability: Option<f64>,
}

impl<T: Transport> Chip<T> {
    pub fn new(transport: T) -> Self {
        Self::with_injector(transport, FaultInjector::from_entropy())
    }

    /// Chip whose simulated upsets are reproducible from `seed`.
    pub fn with_seed(transport: T, seed: u64) -> Self {
        Self::with_injector(transport, FaultInjector::seeded(seed))
    }

    pub fn with_injector(transport: T, injector: FaultInjector) -> Self {
        Self {
            transport,
            injector,
            flip_probability: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Enables (with the given per-read probability) or disables fake bit flips on
    /// every value read from the chip.
    pub fn set_flip_simulation(&mut self, flip_probability: Option<f64>) {
        self.flip_probability = flip_probability;
    }

    pub fn flip_simulation(&self) -> Option<f64> {
        self.flip_probability
    }

    /// Fake flips injected so far.
    pub fn injected_flips(&self) -> u64 {
        self.injector.injected()
    }

    pub fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        let value = self.transport.read(address)?;
        trace!("read [0x{address:04x}] = 0x{value:02x}");
        Ok(match self.flip_probability {
            Some(probability) => self.injector.corrupt(value, probability),
            None => value,
        })
    }

    pub fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        trace!("write [0x{address:04x}] = 0x{value:02x}");
        self.transport.write(address, value)
    }

    /// Writes every byte of `image` in its physical order. Returns the byte count.
    pub fn write_image(&mut self, image: &dyn Image) -> Result<usize, TransportError> {
        let bytes = image.serialize();
        for &(address, value) in &bytes {
            self.write(address, value)?;
        }
        debug!("wrote {} ({} bytes)", image.label(), bytes.len());
        Ok(bytes.len())
    }

    pub fn read_addresses<I>(&mut self, addresses: I) -> Result<Snapshot, TransportError>
    where
        I: IntoIterator<Item = u16>,
    {
        addresses
            .into_iter()
            .map(|address| self.read(address).map(|value| (address, value)))
            .collect::<Result<Vec<_>, _>>()
            .map(Snapshot::new)
    }

    /// Reads back the addresses covered by `image`.
    pub fn read_image(&mut self, image: &dyn Image) -> Result<Snapshot, TransportError> {
        let addresses: Vec<u16> = image.serialize().into_iter().map(|(a, _)| a).collect();
        self.read_addresses(addresses)
    }

    /// Reads the registers of `store` and interprets them as field values.
    pub fn read_fields<'s>(&mut self, store: &'s RegisterStore) -> crate::Result<Vec<(&'s str, u32)>> {
        let snapshot = self.read_addresses(store.layout().addresses())?;
        let bytes: Vec<u8> = snapshot.values().collect();
        Ok(store.deserialize(&bytes)?)
    }

    /// Writes the pixel control register selected by `mask` in broadcast mode.
    pub fn write_pixel_control(&mut self, mask: u8, value: u8) -> Result<(), TransportError> {
        self.write(layout::pix_ctrl_address(mask), value)
    }

    pub fn read_pixel_control(&mut self, mask: u8) -> Result<u8, TransportError> {
        self.read(layout::pix_ctrl_address(mask))
    }
}
