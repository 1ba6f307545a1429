mod error;

pub mod chip;
pub mod config;
pub mod i2c;
pub mod layout;
pub mod monitor;
pub mod register_file;
pub mod regmap;
pub mod session;
pub mod snapshot;
pub mod transport;

// Re-export public API
pub use chip::Chip;
pub use config::{Bus, ConfigError, SessionConfig};
pub use error::{Error, Result};
pub use layout::Target;
pub use monitor::{
    BitFlip, BitFlipMonitor, CancelToken, EventSink, LogSink, MonitorConfig, MonitorEvent,
    MonitorReport, MonitorState, StopReason,
};
pub use register_file::{FaultInjector, SimulatedRegisterFile};
pub use regmap::{FieldSpec, Image, Layout, PatternBuffer, Region, RegisterError, RegisterStore};
pub use session::{Session, SimulatedChip};
pub use snapshot::{ShapeMismatch, Snapshot};
pub use transport::{Transport, TransportError};
