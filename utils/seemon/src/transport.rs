use thiserror::Error;

/// Failure of the underlying register bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("read from register 0x{address:04x} failed: {reason}")]
    Read { address: u16, reason: String },

    #[error("write to register 0x{address:04x} failed: {reason}")]
    Write { address: u16, reason: String },

    #[error("bus protocol error: {0}")]
    Protocol(String),
}

/// Byte-wide register access, backed by hardware or a simulation.
///
/// Addresses are 16 bit: the high byte is the register MSB, the low byte the LSB,
/// exactly as they are latched into the chip before a read or write.
pub trait Transport {
    fn read(&mut self, address: u16) -> Result<u8, TransportError>;

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        (**self).read(address)
    }

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        (**self).write(address, value)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        (**self).read(address)
    }

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        (**self).write(address, value)
    }
}
