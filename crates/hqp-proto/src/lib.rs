//! Wire types for the HQPlayer control port: request/response framing,
//! the playback status model, the shared error taxonomy and configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod platform;
pub mod status;

pub use codec::{Command, Decoded, Element, ParseError};
pub use error::{ControlError, ErrorKind};
pub use status::{PlaybackStatus, TransportState, VolumeBounds, VolumeDb};
