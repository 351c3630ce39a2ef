use std::io;
use thiserror::Error;

/// Errors surfaced by the codecs and the transaction engine.
#[derive(Error, Debug)]
pub enum Error {
	/// The request queue is at capacity.  The request was not accepted;
	/// the caller may retry once a transaction has completed.
	#[error("request queue is full")]
	QueueFull,

	/// A message buffer was shorter than the fixed layout requires.
	#[error("truncated message: need {needed} bytes, got {got}")]
	Truncated { needed: usize, got: usize },

	/// A client frame carried a protocol version or opcode this server
	/// does not speak.  The connection stays open; the frame is dropped.
	#[error("unsupported wire frame: protocol {protocol:#04x}, opcode {opcode:#04x}")]
	UnsupportedFrame { protocol: u8, opcode: u8 },

	/// Out-of-range input.  Programmer error.
	#[error("invalid argument: {0}")]
	InvalidArg(&'static str),

	/// The transport refused or failed to start a transfer.
	#[error("transport error: {0}")]
	Transport(String),

	#[error("i/o error")]
	Io(#[from] io::Error),
}
