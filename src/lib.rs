//! Stand-alone AVR in-system programmer.

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod fuses;
pub mod page;
pub mod protocol;
pub mod transport;

pub use self::config::ProgrammingConfig;
pub use self::device::{Catalog, DeviceDescriptor, FuseCategory, FuseSet};
pub use self::error::{DeviceState, Error, Result};
pub use self::flashing::{AbortSignal, Programmer, SessionResult, State};
pub use self::format::{ImageDecoder, Payload};
pub use self::protocol::{Command, Response};
pub use self::transport::{IspBus, Prescaler};
