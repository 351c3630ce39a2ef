//! This crate provides the low-level message types and the bus transaction
//! engine for talking to DALI lighting buses through USB interface adapters.
//!
//! DALI is a two-wire lighting control bus carrying 16-bit or 24-bit frames.
//! The adapters this crate targets expose the bus as a pair of interrupt
//! endpoints moving fixed 64-byte messages; a request is tagged with a
//! sequence number and the adapter echoes that number on the matching
//! answer, so one request at a time can be in flight per adapter.
//!
//! Since this is a low-level library, it does not open devices or sockets.
//! The [Engine] drives any [Transport] implementation; the daemon built on
//! top of this crate supplies one backed by libusb and hooks the engine's
//! [Event] output up to its TCP clients.
//!
//! # Message layouts
//!
//! Host-to-adapter and adapter-to-host messages use different fixed layouts;
//! see [HostMessage] and [DeviceMessage].  Multi-byte integers are
//! big-endian on the wire.
//!
//! # Reserved sequence number
//!
//! Unsolicited bus traffic is reported with sequence number zero, so the
//! engine never assigns zero to a request: the counter starts at 1 and
//! wraps from 0xff back to 1.

mod engine;
mod error;
mod frame;
mod msg;
pub mod wire;

pub use engine::{
	Completion, Engine, Event, Outcome, Transport, TransferStatus, DEFAULT_QUEUE_LIMIT,
};
pub use error::Error;
pub use frame::DaliFrame;
pub use msg::{DeviceMessage, Direction, HostMessage, Kind, MESSAGE_LENGTH};
