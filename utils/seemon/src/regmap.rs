//! Symbolic register storage.
//!
//! A [`Layout`] is the immutable table describing a register group: field names, the
//! addresses each field occupies (in physical write order) and the field bit widths.
//! A [`RegisterStore`] holds the current values of one layout and serializes them to
//! `(address, byte)` pairs for a bulk write. Memory regions that are filled with a
//! test pattern instead of symbolic values are described by [`Region`] and
//! [`PatternBuffer`].

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("unknown register field '{name}'")]
    InvalidField { name: String },

    #[error("value 0x{value:x} does not fit the {width}-bit field '{name}'")]
    ValueRange { name: String, value: u32, width: u32 },

    #[error("expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid register layout: {0}")]
    InvalidLayout(String),
}

/// Largest value representable in `width` bits.
pub fn width_mask(width: u32) -> u32 {
    if width >= 32 { u32::MAX } else { (1u32 << width) - 1 }
}

/// A named field and the register bytes it spans, least significant byte first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    name: String,
    addresses: Vec<u16>,
    width: u32,
    default: u32,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, addresses: Vec<u16>, width: u32, default: u32) -> Self {
        Self {
            name: name.into(),
            addresses,
            width,
            default,
        }
    }

    /// Plain 8-bit register at a single address.
    pub fn byte(name: impl Into<String>, address: u16, default: u8) -> Self {
        Self::new(name, vec![address], 8, default as u32)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn default_value(&self) -> u32 {
        self.default
    }

    pub fn max(&self) -> u32 {
        width_mask(self.width)
    }

    fn bytes(&self, value: u32) -> impl Iterator<Item = (u16, u8)> + '_ {
        let value = value & self.max();
        self.addresses
            .iter()
            .enumerate()
            .map(move |(i, &address)| (address, (value >> (8 * i)) as u8))
    }
}

/// Ordered field table of one register group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    name: String,
    fields: Vec<FieldSpec>,
}

impl Layout {
    /// Validates the table: unique names and addresses, widths between 1 and 32 bits
    /// that fit the addresses given, defaults within range.
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Result<Self, RegisterError> {
        let name = name.into();
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();

        for field in &fields {
            if !names.insert(field.name.as_str()) {
                return Err(RegisterError::InvalidLayout(format!(
                    "{name}: field '{}' defined twice",
                    field.name
                )));
            }
            if field.width == 0 || field.width > 32 {
                return Err(RegisterError::InvalidLayout(format!(
                    "{name}: field '{}' has width {}",
                    field.name, field.width
                )));
            }
            if field.addresses.is_empty() || (field.addresses.len() as u32) * 8 < field.width {
                return Err(RegisterError::InvalidLayout(format!(
                    "{name}: field '{}' needs {} bits but spans {} address(es)",
                    field.name,
                    field.width,
                    field.addresses.len()
                )));
            }
            if field.addresses.len() > 4 {
                return Err(RegisterError::InvalidLayout(format!(
                    "{name}: field '{}' spans more than 4 bytes",
                    field.name
                )));
            }
            for &address in &field.addresses {
                if !addresses.insert(address) {
                    return Err(RegisterError::InvalidLayout(format!(
                        "{name}: address 0x{address:04x} used twice"
                    )));
                }
            }
            if field.default > field.max() {
                return Err(RegisterError::InvalidLayout(format!(
                    "{name}: default 0x{:x} of '{}' exceeds {} bits",
                    field.default, field.name, field.width
                )));
            }
        }

        Ok(Self { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of register bytes covered by the layout.
    pub fn byte_len(&self) -> usize {
        self.fields.iter().map(|field| field.addresses.len()).sum()
    }

    /// All addresses in write order.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.fields.iter().flat_map(|field| field.addresses.iter().copied())
    }

    pub fn field(&self, name: &str) -> Option<(usize, &FieldSpec)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, field)| field.name == name)
    }

    /// Field occupying `address`, if any.
    pub fn field_at(&self, address: u16) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|field| field.addresses.contains(&address))
    }
}

/// Anything that can be bulk-written to the chip and read back for comparison.
pub trait Image {
    fn label(&self) -> &str;

    /// `(address, byte)` pairs in physical write order.
    fn serialize(&self) -> Vec<(u16, u8)>;

    fn field_name(&self, _address: u16) -> Option<&str> {
        None
    }
}

/// Current values of one register group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterStore {
    layout: Arc<Layout>,
    values: Vec<u32>,
}

impl RegisterStore {
    /// Creates a store holding the layout defaults.
    pub fn new(layout: Arc<Layout>) -> Self {
        let values = layout.fields.iter().map(|field| field.default).collect();
        Self { layout, values }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Sets a field. The store is left untouched when the call fails.
    pub fn set(&mut self, name: &str, value: u32) -> Result<(), RegisterError> {
        let (index, field) = self
            .layout
            .field(name)
            .ok_or_else(|| RegisterError::InvalidField {
                name: name.to_owned(),
            })?;
        if value > field.max() {
            return Err(RegisterError::ValueRange {
                name: name.to_owned(),
                value,
                width: field.width,
            });
        }
        self.values[index] = value;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<u32, RegisterError> {
        self.layout
            .field(name)
            .map(|(index, _)| self.values[index])
            .ok_or_else(|| RegisterError::InvalidField {
                name: name.to_owned(),
            })
    }

    /// Restores every field to its layout default.
    pub fn reset(&mut self) {
        for (value, field) in self.values.iter_mut().zip(&self.layout.fields) {
            *value = field.default;
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.layout
            .fields
            .iter()
            .zip(&self.values)
            .map(|(field, &value)| (field.name(), value))
    }

    /// Interprets raw bytes, ordered as [`Image::serialize`] orders them, as field values.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Vec<(&str, u32)>, RegisterError> {
        let expected = self.layout.byte_len();
        if bytes.len() != expected {
            return Err(RegisterError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let mut cursor = bytes.iter();
        let fields = self
            .layout
            .fields
            .iter()
            .map(|field| {
                let value = cursor
                    .by_ref()
                    .take(field.addresses.len())
                    .enumerate()
                    .fold(0u32, |acc, (i, &byte)| acc | (byte as u32) << (8 * i));
                (field.name(), value & field.max())
            })
            .collect();
        Ok(fields)
    }
}

impl Image for RegisterStore {
    fn label(&self) -> &str {
        self.layout.name()
    }

    fn serialize(&self) -> Vec<(u16, u8)> {
        self.layout
            .fields
            .iter()
            .zip(&self.values)
            .flat_map(|(field, &value)| field.bytes(value))
            .collect()
    }

    fn field_name(&self, address: u16) -> Option<&str> {
        self.layout.field_at(address).map(FieldSpec::name)
    }
}

/// A memory area addressed byte by byte, without symbolic fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    name: String,
    addresses: Vec<u16>,
}

impl Region {
    pub fn new(name: impl Into<String>, addresses: Vec<u16>) -> Result<Self, RegisterError> {
        let name = name.into();
        let mut seen = HashSet::new();
        if let Some(address) = addresses.iter().find(|&&address| !seen.insert(address)) {
            return Err(RegisterError::InvalidLayout(format!(
                "{name}: address 0x{address:04x} used twice"
            )));
        }
        Ok(Self { name, addresses })
    }

    /// `len` consecutive addresses starting at `start`. Fails if the range runs past
    /// the end of the 16-bit address space.
    pub fn contiguous(name: impl Into<String>, start: u16, len: u16) -> Result<Self, RegisterError> {
        let name = name.into();
        let addresses = (0..len)
            .map(|offset| start.checked_add(offset))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                RegisterError::InvalidLayout(format!(
                    "{name}: {len} bytes from 0x{start:04x} exceed the address space"
                ))
            })?;
        Ok(Self { name, addresses })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Contents to be written into a [`Region`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternBuffer {
    region: Region,
    bytes: Vec<u8>,
}

impl PatternBuffer {
    /// Default fill byte of test patterns.
    pub const DEFAULT_FILL: u8 = 0x55;

    pub fn new(region: Region, bytes: Vec<u8>) -> Result<Self, RegisterError> {
        if bytes.len() != region.len() {
            return Err(RegisterError::LengthMismatch {
                expected: region.len(),
                actual: bytes.len(),
            });
        }
        Ok(Self { region, bytes })
    }

    /// The whole region filled with one repeated byte.
    pub fn filled(region: Region, fill: u8) -> Self {
        let bytes = vec![fill; region.len()];
        Self { region, bytes }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Image for PatternBuffer {
    fn label(&self) -> &str {
        self.region.name()
    }

    fn serialize(&self) -> Vec<(u16, u8)> {
        self.region
            .addresses
            .iter()
            .copied()
            .zip(self.bytes.iter().copied())
            .collect()
    }
}
