//! OneBot wire handling
//!
//! Frames plus the minimal event/command views the relay needs for routing.

pub mod frame;
pub mod message;

pub use frame::{preview, Frame};
pub use message::{lifecycle_connect, Command, Echo, Event, EventKind, ProtocolError};
