use std::fmt;

use thiserror::Error;

use crate::regmap::Image;

/// An observation that cannot be compared cell by cell with its reference.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeMismatch {
    #[error("observed {observed} cells, reference has {expected}")]
    Length { expected: usize, observed: usize },

    #[error("observed address 0x{observed:04x} where 0x{expected:04x} was expected")]
    Address { expected: u16, observed: u16 },
}

/// Register contents observed in one pass, as `(address, byte)` in read order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    cells: Vec<(u16, u8)>,
}

impl Snapshot {
    pub fn new(cells: Vec<(u16, u8)>) -> Self {
        Self { cells }
    }

    /// The bytes an image is expected to hold after it was written.
    pub fn of_image(image: &dyn Image) -> Self {
        Self::new(image.serialize())
    }

    pub fn cells(&self) -> &[(u16, u8)] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.cells.iter().map(|&(address, _)| address)
    }

    pub fn values(&self) -> impl Iterator<Item = u8> + '_ {
        self.cells.iter().map(|&(_, value)| value)
    }

    pub fn value_at(&self, address: u16) -> Option<u8> {
        self.cells
            .iter()
            .find(|&&(a, _)| a == address)
            .map(|&(_, value)| value)
    }

    /// Total number of bits set.
    pub fn ones(&self) -> u32 {
        self.values().map(u8::count_ones).sum()
    }

    /// Cells where `observed` differs from `self`, as `(address, expected, observed)`.
    ///
    /// Fails when the two snapshots do not cover the same addresses in the same order.
    pub fn diff(&self, observed: &Snapshot) -> Result<Vec<(u16, u8, u8)>, ShapeMismatch> {
        if self.len() != observed.len() {
            return Err(ShapeMismatch::Length {
                expected: self.len(),
                observed: observed.len(),
            });
        }
        let mut diffs = Vec::new();
        for (&(address, expected), &(seen_at, value)) in self.cells.iter().zip(&observed.cells) {
            if address != seen_at {
                return Err(ShapeMismatch::Address {
                    expected: address,
                    observed: seen_at,
                });
            }
            if expected != value {
                diffs.push((address, expected, value));
            }
        }
        Ok(diffs)
    }
}

impl FromIterator<(u16, u8)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (u16, u8)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Space separated hex dump of the values.
impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.values().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{value:02x}")?;
        }
        Ok(())
    }
}
