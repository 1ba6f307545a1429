//! I2C command framing.
//!
//! The chip is not memory mapped on the bus. A register access is a short command
//! sequence: the address MSB and LSB are latched with `ADD_MSB` / `ADD_LSB`, then a
//! `WR` carries the payload or a `RD` returns the addressed byte. Every command byte
//! carries the 3-bit chip id in its high nibble.

use log::trace;

use crate::layout::Command;
use crate::register_file::SimulatedRegisterFile;
use crate::transport::{Transport, TransportError};

/// Raw command-level bus.
pub trait I2cBus {
    /// Sends `command` followed by `payload`.
    fn write(&mut self, command: u8, payload: &[u8]) -> Result<(), TransportError>;

    /// Sends `command` and reads one byte back.
    fn read(&mut self, command: u8) -> Result<u8, TransportError>;
}

impl<B: I2cBus + ?Sized> I2cBus for Box<B> {
    fn write(&mut self, command: u8, payload: &[u8]) -> Result<(), TransportError> {
        (**self).write(command, payload)
    }

    fn read(&mut self, command: u8) -> Result<u8, TransportError> {
        (**self).read(command)
    }
}

/// Register-level [`Transport`] over a command-level [`I2cBus`].
pub struct I2cTransport<B> {
    bus: B,
    chip_id: u8,
    msb: Option<u8>,
}

impl<B: I2cBus> I2cTransport<B> {
    pub fn new(bus: B, chip_id: u8) -> Self {
        Self {
            bus,
            chip_id: chip_id & 0b111,
            msb: None,
        }
    }

    pub fn chip_id(&self) -> u8 {
        self.chip_id
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    fn select(&mut self, address: u16) -> Result<(), TransportError> {
        let [msb, lsb] = address.to_be_bytes();
        // Consecutive registers of a group share the MSB.
        if self.msb != Some(msb) {
            self.msb = None;
            self.bus.write(Command::AddMsb.byte(self.chip_id), &[msb])?;
            self.msb = Some(msb);
        }
        self.bus.write(Command::AddLsb.byte(self.chip_id), &[lsb])
    }
}

impl<B: I2cBus> Transport for I2cTransport<B> {
    fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        self.select(address)?;
        self.bus.read(Command::Rd.byte(self.chip_id))
    }

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        self.select(address)?;
        self.bus.write(Command::Wr.byte(self.chip_id), &[value])
    }
}

/// Command decoder in front of a [`SimulatedRegisterFile`].
pub struct SimulatedI2c {
    chip_id: u8,
    regs: SimulatedRegisterFile,
    msb: Option<u8>,
    lsb: Option<u8>,
}

impl SimulatedI2c {
    pub fn new(chip_id: u8, regs: SimulatedRegisterFile) -> Self {
        Self {
            chip_id: chip_id & 0b111,
            regs,
            msb: None,
            lsb: None,
        }
    }

    pub fn regs(&self) -> &SimulatedRegisterFile {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut SimulatedRegisterFile {
        &mut self.regs
    }

    pub fn into_regs(self) -> SimulatedRegisterFile {
        self.regs
    }

    fn decode(&self, byte: u8) -> Result<Command, TransportError> {
        let (chip_id, command) = Command::decode(byte);
        if chip_id != self.chip_id {
            return Err(TransportError::Protocol(format!(
                "command 0x{byte:02x} addressed to chip {chip_id}, simulating chip {}",
                self.chip_id
            )));
        }
        command.ok_or_else(|| TransportError::Protocol(format!("unknown command 0x{byte:02x}")))
    }

    fn address(&self) -> Result<u16, TransportError> {
        match (self.msb, self.lsb) {
            (Some(msb), Some(lsb)) => Ok(u16::from_be_bytes([msb, lsb])),
            _ => Err(TransportError::Protocol(
                "register access before address was set".into(),
            )),
        }
    }
}

fn single_byte(command: Command, payload: &[u8]) -> Result<u8, TransportError> {
    match payload {
        [byte] => Ok(*byte),
        _ => Err(TransportError::Protocol(format!(
            "{command:?} expects one payload byte, got {}",
            payload.len()
        ))),
    }
}

impl I2cBus for SimulatedI2c {
    fn write(&mut self, command: u8, payload: &[u8]) -> Result<(), TransportError> {
        let decoded = self.decode(command)?;
        trace!("< write 0x{command:02x}: {payload:02x?}");
        match decoded {
            Command::AddMsb => self.msb = Some(single_byte(decoded, payload)?),
            Command::AddLsb => self.lsb = Some(single_byte(decoded, payload)?),
            Command::Wr => {
                let value = single_byte(decoded, payload)?;
                let address = self.address()?;
                self.regs.set(address, value);
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "{other:?} is not supported by the simulator"
                )));
            }
        }
        Ok(())
    }

    fn read(&mut self, command: u8) -> Result<u8, TransportError> {
        match self.decode(command)? {
            Command::Rd => {
                let address = self.address()?;
                let value = self.regs.read(address)?;
                trace!("> read 0x{command:02x} [0x{address:04x}]: 0x{value:02x}");
                Ok(value)
            }
            other => Err(TransportError::Protocol(format!(
                "read issued with {other:?} command"
            ))),
        }
    }
}
