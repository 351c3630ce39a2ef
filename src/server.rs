//! TCP server: IPv4 listener and the table of live client connections.
//!
//! Clients speak fixed 4-byte frames (see `dali_core::wire`).  Each
//! connection allows one outstanding request at a time; between sending a
//! request and seeing its reply the connection is `waiting` and receives
//! no broadcasts.
//!
//! The table hands out [ClientId] values instead of references: a slot plus
//! a generation counter.  A transaction can therefore outlive its client —
//! resolution after the client disconnected simply finds a tombstone (empty
//! slot or changed generation) and the delivery is dropped.

use std::io::{self, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use log::{debug, info, warn};

use dali_core::wire;

/// Hard cap on simultaneously connected clients.
pub const MAX_CONNECTIONS: usize = 50;

const LISTEN_BACKLOG: libc::c_int = 50;

/// Stable handle to a connection.  Copies of it stay valid (and resolve to
/// nothing) after the connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId {
	slot: usize,
	generation: u32,
}

pub struct Connection {
	stream: TcpStream,
	peer: SocketAddrV4,
	generation: u32,
	/// One request may be in flight; no broadcasts while it is.
	pub waiting: bool,
	/// Slot in the dispatcher's poll set, maintained via reindex.
	pub poll_index: usize,
}

pub struct Server {
	listener: TcpListener,
	slots: Vec<Option<Connection>>,
	next_generation: u32,
}

impl Server {
	/// Bind and listen.  The socket is created through libc so
	/// `SO_REUSEADDR` can go on before `bind`.
	pub fn open(address: Ipv4Addr, port: u16) -> io::Result<Server> {
		let fd = unsafe { libc::socket(libc::PF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}
		let reuse: libc::c_int = 1;
		let rc = unsafe {
			libc::setsockopt(
				fd,
				libc::SOL_SOCKET,
				libc::SO_REUSEADDR,
				&reuse as *const libc::c_int as *const libc::c_void,
				mem::size_of::<libc::c_int>() as libc::socklen_t,
			)
		};
		if rc != 0 {
			return Err(close_with_error(fd));
		}
		let addr = libc::sockaddr_in {
			sin_family: libc::AF_INET as libc::sa_family_t,
			sin_port: port.to_be(),
			sin_addr: libc::in_addr {
				s_addr: u32::from(address).to_be(),
			},
			sin_zero: [0; 8],
		};
		let rc = unsafe {
			libc::bind(
				fd,
				&addr as *const libc::sockaddr_in as *const libc::sockaddr,
				mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
			)
		};
		if rc != 0 {
			return Err(close_with_error(fd));
		}
		if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
			return Err(close_with_error(fd));
		}
		let listener = unsafe { TcpListener::from_raw_fd(fd) };
		info!("listening on {}:{}", address, listener.local_addr()?.port());
		Ok(Server {
			listener,
			slots: Vec::new(),
			next_generation: 0,
		})
	}

	pub fn listener_fd(&self) -> RawFd {
		self.listener.as_raw_fd()
	}

	/// The bound address (useful when port 0 was requested).
	pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
		self.listener.local_addr()
	}

	pub fn live_connections(&self) -> usize {
		self.slots.iter().filter(|slot| slot.is_some()).count()
	}

	/// Accept one connection.  Non-IPv4 peers are refused, and so is
	/// everything past the connection cap.
	pub fn accept(&mut self) -> Option<(ClientId, RawFd)> {
		let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
		let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
		let fd = unsafe {
			libc::accept(
				self.listener.as_raw_fd(),
				&mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
				&mut addr_len,
			)
		};
		if fd < 0 {
			warn!("error accepting connection: {}", io::Error::last_os_error());
			return None;
		}
		if addr.sin_family != libc::AF_INET as libc::sa_family_t {
			warn!(
				"refusing connection with address family {}",
				addr.sin_family
			);
			unsafe { libc::close(fd) };
			return None;
		}
		if self.live_connections() >= MAX_CONNECTIONS {
			warn!("connection limit reached, refusing new connection");
			unsafe { libc::close(fd) };
			return None;
		}
		let stream = unsafe { TcpStream::from_raw_fd(fd) };
		let peer = SocketAddrV4::new(
			Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
			u16::from_be(addr.sin_port),
		);
		self.next_generation += 1;
		let generation = self.next_generation;
		let connection = Connection {
			stream,
			peer,
			generation,
			waiting: false,
			poll_index: 0,
		};
		let slot = match self.slots.iter().position(|slot| slot.is_none()) {
			Some(slot) => {
				self.slots[slot] = Some(connection);
				slot
			}
			None => {
				self.slots.push(Some(connection));
				self.slots.len() - 1
			}
		};
		info!("got connection from {}", peer);
		Some((ClientId { slot, generation }, fd))
	}

	pub fn contains(&self, id: ClientId) -> bool {
		self.resolve(id).is_some()
	}

	fn resolve(&self, id: ClientId) -> Option<&Connection> {
		self.slots
			.get(id.slot)
			.and_then(|slot| slot.as_ref())
			.filter(|connection| connection.generation == id.generation)
	}

	pub fn connection_mut(&mut self, id: ClientId) -> Option<&mut Connection> {
		self.slots
			.get_mut(id.slot)
			.and_then(|slot| slot.as_mut())
			.filter(|connection| connection.generation == id.generation)
	}

	/// Read one frame off a ready connection.  `None` means the connection
	/// is done for: closed, errored, or it sent a partial frame.
	pub fn read_frame(&mut self, id: ClientId) -> Option<[u8; wire::FRAME_LENGTH]> {
		let connection = self.connection_mut(id)?;
		let peer = connection.peer;
		let mut buffer = [0u8; wire::FRAME_LENGTH];
		match connection.stream.read(&mut buffer) {
			Ok(0) => {
				info!("connection from {} closed", peer);
				None
			}
			Ok(n) if n == wire::FRAME_LENGTH => Some(buffer),
			Ok(n) => {
				warn!("short read from {}, only got {} bytes", peer, n);
				None
			}
			Err(err) => {
				warn!("error reading from {}: {}", peer, err);
				None
			}
		}
	}

	/// Write an in-band reply.  Only a waiting connection takes one; the
	/// write clears `waiting`.  `false` means the connection broke and
	/// should be dropped.
	pub fn reply(&mut self, id: ClientId, reply: &wire::Reply) -> bool {
		let connection = match self.connection_mut(id) {
			Some(connection) => connection,
			None => {
				debug!("connection is gone, ignoring reply");
				return true;
			}
		};
		if !connection.waiting {
			debug!("connection from {} is not waiting, ignoring reply", connection.peer);
			return true;
		}
		connection.waiting = false;
		let peer = connection.peer;
		match connection.stream.write_all(&reply.pack()) {
			Ok(()) => true,
			Err(err) => {
				warn!("error writing to {}: {}", peer, err);
				false
			}
		}
	}

	/// Fan an out-of-band frame out to every connection that is not
	/// waiting for a reply of its own.  Returns the connections whose
	/// sockets broke mid-write.
	pub fn broadcast(&mut self, reply: &wire::Reply) -> Vec<ClientId> {
		let bytes = reply.pack();
		let mut broken = Vec::new();
		for (slot, entry) in self.slots.iter_mut().enumerate() {
			if let Some(connection) = entry {
				if connection.waiting {
					continue;
				}
				if let Err(err) = connection.stream.write_all(&bytes) {
					warn!("error writing to {}: {}", connection.peer, err);
					broken.push(ClientId {
						slot,
						generation: connection.generation,
					});
				}
			}
		}
		broken
	}

	/// Remove a connection.  The socket closes when the stream drops;
	/// the returned descriptor is only good for poll-set cleanup.
	pub fn close(&mut self, id: ClientId) -> Option<RawFd> {
		self.resolve(id)?;
		let connection = self.slots[id.slot].take()?;
		info!("closing connection from {}", connection.peer);
		Some(connection.stream.as_raw_fd())
	}

	/// Every live connection, for shutdown sweeps.
	pub fn client_ids(&self) -> Vec<ClientId> {
		self.slots
			.iter()
			.enumerate()
			.filter_map(|(slot, entry)| {
				entry.as_ref().map(|connection| ClientId {
					slot,
					generation: connection.generation,
				})
			})
			.collect()
	}
}

fn close_with_error(fd: RawFd) -> io::Error {
	let err = io::Error::last_os_error();
	unsafe { libc::close(fd) };
	err
}
