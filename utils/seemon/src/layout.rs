//! MIMOSIS-1 register map.
//!
//! Register addresses are formed from the MSB and LSB bytes latched with the
//! `ADD_MSB` / `ADD_LSB` commands. Factory defaults of the general configuration and
//! DAC groups correspond to the no-PLL beam-test configuration (rescue clock, all
//! eight outputs enabled).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use crate::regmap::{FieldSpec, Layout, PatternBuffer, Region, RegisterError, RegisterStore};

/// I2C command identifiers, placed in the low nibble of the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Instr = 1,
    AddMsb = 2,
    AddLsb = 3,
    Wr = 4,
    Rd = 5,
    WrInd = 6,
    RdInd = 7,
    WrOff = 8,
    RdOff = 9,
}

impl Command {
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            1 => Self::Instr,
            2 => Self::AddMsb,
            3 => Self::AddLsb,
            4 => Self::Wr,
            5 => Self::Rd,
            6 => Self::WrInd,
            7 => Self::RdInd,
            8 => Self::WrOff,
            9 => Self::RdOff,
            _ => return None,
        })
    }

    /// Command byte for `chip_id`: three id bits above the command nibble.
    pub fn byte(self, chip_id: u8) -> u8 {
        (0b111 & chip_id) << 4 | (0b1111 & self as u8)
    }

    /// Splits a command byte into chip id and command.
    pub fn decode(byte: u8) -> (u8, Option<Self>) {
        ((byte >> 4) & 0b111, Self::from_id(byte & 0b1111))
    }
}

/// Base addresses of the register groups.
pub mod base {
    pub const GEN_CONF: u16 = 0x0020;
    pub const DAC: u16 = 0x0040;
    pub const SEQ_CONF: u16 = 0x0060;
    pub const PIX_CTRL: u16 = 0x0080;
    pub const MON: u16 = 0x00E0;
    pub const MFE: u16 = 0x8000;
    pub const ANA_PIX_SEL: u16 = 0x8020;
    pub const RO_TST_CONF: u16 = 0x8040;
}

/// Broadcast bit of the pixel control MSB.
pub const PIX_CTRL_BROADCAST_MSB: u8 = 0b0100_0000;

pub const MFE_REGIONS: u16 = 64;
pub const MFE_FRAMES: u16 = 8;
/// Set in the LSB to address the high byte of an MFE cell.
pub const MFE_HIGH_BYTE: u16 = 0b1000;

const GEN_CONF_DEFAULTS: [(&str, u8); 16] = [
    ("RUNMODE", 0x40),
    ("TRIMDAC", 0x6E),
    ("INJCURR", 0x00),
    ("INJVOLT1", 0x00),
    ("INJVOLT2", 0x00),
    ("MONCURR", 0x00),
    ("MONVOLT", 0x00),
    ("CLKGEN1", 0x01),
    ("CLKGEN2", 0x01),
    ("PLL", 0x16),
    ("PLLLOCK", 0x00),
    ("MONTEMP", 0x00),
    ("SLVSTX", 0x15),
    ("SLVSRX", 0x00),
    ("OUTPUT", 0x17),
    ("MONPWR", 0x00),
];

const DAC_DEFAULTS: [(&str, u8); 15] = [
    ("IBIAS", 64),
    ("ITHR", 52),
    ("IDB", 28),
    ("VRESET", 171),
    ("VPL", 70),
    ("VPH", 85),
    ("VPH_FINE", 0),
    ("VCASP", 67),
    ("VCASNA", 1),
    ("VCASNB", 1),
    ("VCASNC", 1),
    ("VCASND", 1),
    ("VCASN2", 83),
    ("VCLIP", 50),
    ("IBUFBIAS", 125),
];

fn byte_layout(name: &str, base: u16, defaults: &[(&str, u8)]) -> Layout {
    let fields = defaults
        .iter()
        .zip(base..)
        .map(|(&(field, default), address)| FieldSpec::byte(field, address, default))
        .collect();
    // Built-in tables always validate.
    Layout::new(name, fields).unwrap_or_else(|err| panic!("built-in layout {name}: {err}"))
}

fn built_in_region(region: Result<Region, RegisterError>) -> Region {
    region.unwrap_or_else(|err| panic!("built-in region: {err}"))
}

/// General configuration registers, 16 bytes.
pub fn gen_conf() -> Layout {
    byte_layout("GenConf", base::GEN_CONF, &GEN_CONF_DEFAULTS)
}

/// DAC registers, 15 bytes.
pub fn dac() -> Layout {
    byte_layout("DAC", base::DAC, &DAC_DEFAULTS)
}

/// Monitoring registers, 15 raw bytes.
pub fn monitoring() -> Region {
    built_in_region(Region::contiguous("Mon", base::MON, 15))
}

/// Readout test configuration, 20 bytes.
pub fn ro_tst_conf() -> Region {
    built_in_region(Region::contiguous("RoTstConf", base::RO_TST_CONF, 20))
}

/// Address of one byte of the multi-frame emulation memory.
pub fn mfe_address(region: u16, frame: u16, high: bool) -> u16 {
    let msb = (base::MFE >> 8) | (region & 0b11_1111);
    let lsb = (base::MFE & 0b1111_1000) | (frame & 0b111) | (if high { MFE_HIGH_BYTE } else { 0 });
    msb << 8 | lsb
}

/// Multi-frame emulation memory: 64 regions of 8 frames, each cell 16 bit, written
/// low byte first.
pub fn mfe() -> Region {
    let addresses = (0..MFE_REGIONS)
        .flat_map(|region| (0..MFE_FRAMES).map(move |frame| (region, frame)))
        .flat_map(|(region, frame)| {
            [
                mfe_address(region, frame, false),
                mfe_address(region, frame, true),
            ]
        })
        .collect();
    built_in_region(Region::new("MFE", addresses))
}

/// Broadcast pixel control register selected by `mask`.
pub fn pix_ctrl_address(mask: u8) -> u16 {
    let lsb = (base::PIX_CTRL as u8 & 0b1110_0000) | (mask & 0b1_1111);
    (PIX_CTRL_BROADCAST_MSB as u16) << 8 | lsb as u16
}

/// Register group a monitoring session watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    GenConf,
    Dac,
    Monitoring,
    RoTstConf,
    Mfe,
}

impl Target {
    pub const ALL: [Target; 5] = [
        Target::GenConf,
        Target::Dac,
        Target::Monitoring,
        Target::RoTstConf,
        Target::Mfe,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Target::GenConf => "gen-conf",
            Target::Dac => "dac",
            Target::Monitoring => "monitoring",
            Target::RoTstConf => "ro-tst-conf",
            Target::Mfe => "mfe",
        }
    }

    /// Symbolic layout of the target, `None` for pattern-filled regions.
    pub fn layout(self) -> Option<Layout> {
        match self {
            Target::GenConf => Some(gen_conf()),
            Target::Dac => Some(dac()),
            _ => None,
        }
    }

    /// Region of the target, `None` for symbolic groups.
    pub fn region(self) -> Option<Region> {
        match self {
            Target::Monitoring => Some(monitoring()),
            Target::RoTstConf => Some(ro_tst_conf()),
            Target::Mfe => Some(mfe()),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::ALL
            .into_iter()
            .find(|target| target.name() == s)
            .ok_or_else(|| format!("unknown target '{s}'"))
    }
}

/// Stores of both symbolic groups, holding factory defaults.
pub fn default_stores() -> (RegisterStore, RegisterStore) {
    (
        RegisterStore::new(Arc::new(gen_conf())),
        RegisterStore::new(Arc::new(dac())),
    )
}

/// Default test pattern for a region.
pub fn default_pattern(region: Region) -> PatternBuffer {
    PatternBuffer::filled(region, PatternBuffer::DEFAULT_FILL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regmap::Image;

    #[test]
    fn command_byte_carries_chip_id() {
        assert_eq!(Command::AddMsb.byte(1), 0x12);
        assert_eq!(Command::Rd.byte(7), 0x75);
        assert_eq!(Command::Wr.byte(0b1010), 0x24);
        assert_eq!(Command::decode(0x35), (3, Some(Command::Rd)));
        assert_eq!(Command::decode(0x3F), (3, None));
    }

    #[test]
    fn gen_conf_defaults_in_write_order() {
        let store = RegisterStore::new(Arc::new(gen_conf()));
        let bytes = store.serialize();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], (0x0020, 0x40));
        assert_eq!(bytes[9], (0x0029, 0x16));
        assert_eq!(bytes[15], (0x002F, 0x00));
        assert_eq!(store.field_name(0x002E), Some("OUTPUT"));
    }

    #[test]
    fn dac_layout_covers_fifteen_registers() {
        let layout = dac();
        assert_eq!(layout.byte_len(), 15);
        assert_eq!(layout.field("VRESET").unwrap().1.default_value(), 171);
        assert_eq!(layout.addresses().last(), Some(0x004E));
    }

    #[test]
    fn mfe_region_includes_high_bytes() {
        let region = mfe();
        assert_eq!(region.len(), 64 * 8 * 2);
        assert_eq!(&region.addresses()[..4], &[0x8000, 0x8008, 0x8001, 0x8009]);
        assert_eq!(*region.addresses().last().unwrap(), 0xBF0F);
    }

    #[test]
    fn groups_do_not_overlap() {
        let mut all: Vec<u16> = gen_conf().addresses().collect();
        all.extend(dac().addresses());
        all.extend(monitoring().addresses());
        all.extend(ro_tst_conf().addresses());
        all.extend(mfe().addresses());
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }

    #[test]
    fn pixel_control_uses_broadcast_msb() {
        assert_eq!(pix_ctrl_address(0x1F), 0x409F);
        assert_eq!(pix_ctrl_address(0xFF), 0x409F);
        assert_eq!(pix_ctrl_address(0x02), 0x4082);
    }

    #[test]
    fn target_names_round_trip() {
        for target in Target::ALL {
            assert_eq!(target.name().parse::<Target>(), Ok(target));
        }
        assert!("seq-conf".parse::<Target>().is_err());
    }
}
