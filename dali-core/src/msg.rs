use std::fmt;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;
use crate::frame::DaliFrame;

/// Every adapter message is padded to this fixed transfer length.
pub const MESSAGE_LENGTH: usize = 64;

/// Smallest prefix of an inbound message that carries meaning.
const DEVICE_MESSAGE_LENGTH: usize = 9;

const DIRECTION_DALI: u8 = 0x11;
const DIRECTION_USB: u8 = 0x12;

const TYPE_16BIT: u8 = 0x03;
const TYPE_24BIT: u8 = 0x04;
const TYPE_16BIT_COMPLETE: u8 = 0x71;
const TYPE_24BIT_COMPLETE: u8 = 0x72;
const TYPE_16BIT_TRANSFER: u8 = 0x73;
const TYPE_24BIT_TRANSFER: u8 = 0x74;

/// Which side of the adapter a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// Originated on the DALI bus, without host solicitation.
	Dali,
	/// Traffic for a host-issued request.
	Usb,
	Unknown(u8),
}

/// What an inbound message means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	/// End-of-transaction marker; carries only status and sequence number.
	Completion,
	/// A frame observed on the wire.
	Transfer,
	Unknown(u8),
}

/// An outbound request message.
///
/// The first eight bytes carry the request; the rest of the 64-byte
/// transfer is zero padding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostMessage {
	pub seqnum: u8,
	pub frame: DaliFrame,
}

impl HostMessage {
	pub fn pack(&self) -> Result<[u8; MESSAGE_LENGTH], Error> {
		let mut buffer = [0u8; MESSAGE_LENGTH];
		let mut c = Cursor::new(&mut buffer[..]);
		c.write_u8(DIRECTION_USB)?;
		c.write_u8(self.seqnum)?;
		c.write_u8(0)?;
		if self.frame.is_extended() {
			c.write_u8(TYPE_24BIT)?;
			c.write_u8(0)?;
			c.write_u8(self.frame.ecommand)?;
		} else {
			c.write_u8(TYPE_16BIT)?;
			c.write_u8(0)?;
			c.write_u8(0)?;
		}
		c.write_u8(self.frame.address)?;
		c.write_u8(self.frame.command)?;
		Ok(buffer)
	}
}

impl fmt::Display for HostMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Direction: USB<->DALI Sequence number: {:02x} ", self.seqnum)?;
		if self.frame.is_extended() {
			write!(
				f,
				"Type: 24bit DALI Command: {:02x} Address: {:02x} Value: {:02x}",
				self.frame.ecommand, self.frame.address, self.frame.command
			)
		} else {
			write!(
				f,
				"Type: 16bit DALI Address: {:02x} Command: {:02x}",
				self.frame.address, self.frame.command
			)
		}
	}
}

/// A decoded inbound message.
///
/// Observed traffic, for reference (direction, type, ?, ecommand, address,
/// command, status, status, seqnum):
///
/// ```text
/// 11 73 00 00 ff 93 ff ff 00
/// 12 73 00 00 ff 08 ff ff 1d
/// 12 71 00 00 00 00 00 8a 1d
/// 11 74 00 04 81 6c ff ff 00
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceMessage {
	pub direction: Direction,
	pub kind: Kind,
	/// Frame payload; meaningful on transfers only.
	pub frame: DaliFrame,
	pub status: u16,
	pub seqnum: u8,
}

impl DeviceMessage {
	pub fn unpack(buffer: &[u8]) -> Result<DeviceMessage, Error> {
		if buffer.len() < DEVICE_MESSAGE_LENGTH {
			return Err(Error::Truncated {
				needed: DEVICE_MESSAGE_LENGTH,
				got: buffer.len(),
			});
		}
		let mut c = Cursor::new(buffer);
		let direction = c.read_u8()?;
		let mtype = c.read_u8()?;
		let _reserved = c.read_u8()?;
		let ecommand = c.read_u8()?;
		let address = c.read_u8()?;
		let command = c.read_u8()?;
		let status = c.read_u16::<BigEndian>()?;
		let seqnum = c.read_u8()?;

		let direction = match direction {
			DIRECTION_DALI => Direction::Dali,
			DIRECTION_USB => Direction::Usb,
			other => Direction::Unknown(other),
		};
		let (kind, extended) = match mtype {
			TYPE_16BIT_COMPLETE => (Kind::Completion, false),
			TYPE_24BIT_COMPLETE => (Kind::Completion, true),
			TYPE_16BIT_TRANSFER => (Kind::Transfer, false),
			TYPE_24BIT_TRANSFER => (Kind::Transfer, true),
			other => (Kind::Unknown(other), false),
		};
		let frame = if extended {
			DaliFrame::extended(ecommand, address, command)
		} else {
			DaliFrame::new(address, command)
		};

		Ok(DeviceMessage {
			direction,
			kind,
			frame,
			status,
			seqnum,
		})
	}

	/// The inverse of [DeviceMessage::unpack].  The daemon never sends
	/// these; device simulators and the engine tests do.
	pub fn pack(&self) -> Result<[u8; MESSAGE_LENGTH], Error> {
		let mut buffer = [0u8; MESSAGE_LENGTH];
		let mut c = Cursor::new(&mut buffer[..]);
		c.write_u8(match self.direction {
			Direction::Dali => DIRECTION_DALI,
			Direction::Usb => DIRECTION_USB,
			Direction::Unknown(other) => other,
		})?;
		let extended = self.frame.is_extended();
		c.write_u8(match self.kind {
			Kind::Completion if extended => TYPE_24BIT_COMPLETE,
			Kind::Completion => TYPE_16BIT_COMPLETE,
			Kind::Transfer if extended => TYPE_24BIT_TRANSFER,
			Kind::Transfer => TYPE_16BIT_TRANSFER,
			Kind::Unknown(other) => other,
		})?;
		c.write_u8(0)?;
		c.write_u8(self.frame.ecommand)?;
		c.write_u8(self.frame.address)?;
		c.write_u8(self.frame.command)?;
		c.write_u16::<BigEndian>(self.status)?;
		c.write_u8(self.seqnum)?;
		Ok(buffer)
	}
}

impl fmt::Display for DeviceMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.direction {
			Direction::Dali => write!(f, "Direction: DALI<->DALI ")?,
			Direction::Usb => write!(f, "Direction: USB<->DALI ")?,
			Direction::Unknown(other) => write!(f, "Direction: Unknown ({:02x}) ", other)?,
		}
		match (self.kind, self.frame.is_extended()) {
			(Kind::Completion, false) => write!(f, "Type: 16bit DALI Complete ")?,
			(Kind::Completion, true) => write!(f, "Type: 24bit DALI Complete ")?,
			(Kind::Transfer, false) => {
				write!(
					f,
					"Type: 16bit DALI Transfer Address: {:02x} Command: {:02x} ",
					self.frame.address, self.frame.command
				)?;
			}
			(Kind::Transfer, true) => {
				write!(
					f,
					"Type: 24bit DALI Transfer Command: {:02x} Address: {:02x} Value: {:02x} ",
					self.frame.ecommand, self.frame.address, self.frame.command
				)?;
			}
			(Kind::Unknown(other), _) => write!(f, "Type: Unknown ({:02x}) ", other)?,
		}
		write!(f, "Status: {:04x} ", self.status)?;
		if self.kind == Kind::Completion {
			write!(f, "Sequence number: {:02x} ", self.seqnum)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_pack_16bit_request() {
		let msg = HostMessage {
			seqnum: 0x1d,
			frame: DaliFrame::new(0xff, 0x08),
		};
		let buffer = msg.pack().unwrap();
		assert_eq!(
			&buffer[0..8],
			&[0x12, 0x1d, 0x00, 0x03, 0x00, 0x00, 0xff, 0x08]
		);
		assert!(buffer[8..].iter().all(|&b| b == 0));
	}

	#[test]
	fn test_pack_24bit_request() {
		let msg = HostMessage {
			seqnum: 0xce,
			frame: DaliFrame::extended(0x07, 0x01, 0xd5),
		};
		let buffer = msg.pack().unwrap();
		assert_eq!(
			&buffer[0..8],
			&[0x12, 0xce, 0x00, 0x04, 0x00, 0x07, 0x01, 0xd5]
		);
	}

	#[test]
	fn test_decode_response_transfer() {
		let v = vec![0x12, 0x73, 0x00, 0x00, 0xff, 0x08, 0xff, 0xff, 0x1d];
		let msg = DeviceMessage::unpack(&v).unwrap();
		assert_eq!(msg.direction, Direction::Usb);
		assert_eq!(msg.kind, Kind::Transfer);
		assert_eq!(msg.frame, DaliFrame::new(0xff, 0x08));
		assert_eq!(msg.status, 0xffff);
		assert_eq!(msg.seqnum, 0x1d);
	}

	#[test]
	fn test_decode_completion() {
		let v = vec![0x12, 0x71, 0x00, 0x00, 0x00, 0x00, 0x00, 0x8a, 0x1d];
		let msg = DeviceMessage::unpack(&v).unwrap();
		assert_eq!(msg.direction, Direction::Usb);
		assert_eq!(msg.kind, Kind::Completion);
		assert_eq!(msg.status, 0x008a);
		assert_eq!(msg.seqnum, 0x1d);
	}

	#[test]
	fn test_decode_bus_transfer() {
		let v = vec![0x11, 0x73, 0x00, 0x00, 0xff, 0x93, 0xff, 0xff, 0x00];
		let msg = DeviceMessage::unpack(&v).unwrap();
		assert_eq!(msg.direction, Direction::Dali);
		assert_eq!(msg.kind, Kind::Transfer);
		assert_eq!(msg.frame, DaliFrame::new(0xff, 0x93));
		assert_eq!(msg.seqnum, 0);
	}

	#[test]
	fn test_decode_extended_bus_transfer() {
		let v = vec![0x11, 0x74, 0x00, 0x04, 0x81, 0x6c, 0xff, 0xff, 0x00];
		let msg = DeviceMessage::unpack(&v).unwrap();
		assert_eq!(msg.direction, Direction::Dali);
		assert_eq!(msg.kind, Kind::Transfer);
		assert_eq!(msg.frame, DaliFrame::extended(0x04, 0x81, 0x6c));
	}

	#[test]
	fn test_decode_unknown_type() {
		let v = vec![0x11, 0x77, 0x00, 0x00, 0x00, 0x03, 0x00, 0x53, 0x00];
		let msg = DeviceMessage::unpack(&v).unwrap();
		assert_eq!(msg.kind, Kind::Unknown(0x77));
	}

	#[test]
	fn test_decode_truncated() {
		let v = vec![0x12, 0x71, 0x00, 0x00, 0x00, 0x00, 0x00, 0x8a];
		assert!(matches!(
			DeviceMessage::unpack(&v),
			Err(Error::Truncated { needed: 9, got: 8 })
		));
	}

	#[test]
	fn test_device_roundtrip() {
		for frame in [
			DaliFrame::new(0xfe, 0x60),
			DaliFrame::extended(0x04, 0x81, 0x6c),
		] {
			let msg = DeviceMessage {
				direction: Direction::Usb,
				kind: Kind::Transfer,
				frame,
				status: 0x1234,
				seqnum: 7,
			};
			let unpacked = DeviceMessage::unpack(&msg.pack().unwrap()).unwrap();
			assert_eq!(msg, unpacked);
		}
	}
}
