use crate::error::Error;
use crate::frame::DaliFrame;

/// Client connections speak fixed-size frames of this many bytes.
pub const FRAME_LENGTH: usize = 4;

/// Protocol version tag carried in the first byte of every frame.
const PROTOCOL: u8 = 0x02;

/// The only client opcode: put a frame on the bus and wait for the answer.
const OPCODE_SEND: u8 = 0x00;

const STATUS_SUCCESS: u8 = 0x00;
const STATUS_RESPONSE: u8 = 0x01;
const STATUS_BROADCAST: u8 = 0x02;
const STATUS_ERROR: u8 = 0xff;

/// A client command frame: `[protocol, opcode, address, command]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
	pub address: u8,
	pub command: u8,
}

impl Request {
	pub fn unpack(buffer: &[u8; FRAME_LENGTH]) -> Result<Request, Error> {
		if buffer[0] != PROTOCOL || buffer[1] != OPCODE_SEND {
			return Err(Error::UnsupportedFrame {
				protocol: buffer[0],
				opcode: buffer[1],
			});
		}
		Ok(Request {
			address: buffer[2],
			command: buffer[3],
		})
	}

	/// Client-side encoding; the server only ever unpacks these.
	pub fn pack(&self) -> [u8; FRAME_LENGTH] {
		[PROTOCOL, OPCODE_SEND, self.address, self.command]
	}

	pub fn frame(&self) -> DaliFrame {
		DaliFrame::new(self.address, self.command)
	}
}

/// A server frame going back to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
	/// The request went out on the bus; `response` is the low byte of the
	/// adapter status word.
	Success { response: u8 },
	/// A synthesized answer (dry-run operation).
	Response { response: u8 },
	/// An unsolicited frame seen on the bus, fanned out to idle clients.
	Broadcast { address: u8, command: u8 },
	/// The request failed; the transaction is over.
	Error,
}

impl Reply {
	pub fn pack(&self) -> [u8; FRAME_LENGTH] {
		match *self {
			Reply::Success { response } => [PROTOCOL, STATUS_SUCCESS, response, 0x00],
			Reply::Response { response } => [PROTOCOL, STATUS_RESPONSE, response, 0x00],
			Reply::Broadcast { address, command } => [PROTOCOL, STATUS_BROADCAST, address, command],
			Reply::Error => [PROTOCOL, STATUS_ERROR, 0x00, 0x00],
		}
	}
}
