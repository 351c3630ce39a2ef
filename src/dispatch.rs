//! Readiness dispatcher: one poll(2) set driving the whole daemon.
//!
//! Every descriptor the process cares about (listener, client sockets,
//! libusb descriptors, the wakeup pipe) is registered here together with
//! its handlers.  Handlers receive the shared context `C` and hand back an
//! [Action]; structural changes to the set are applied only after the
//! handler pass, so the parallel arrays never shift underneath the
//! iteration.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::debug;

/// What a handler saw go wrong on its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
	/// The descriptor is not open (`POLLNVAL`).
	InvalidFd,
	/// The descriptor signalled an error condition (`POLLERR`).
	PollError,
	/// The peer hung up (`POLLHUP`).
	Closed,
}

/// Result of one [Dispatcher::run] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
	/// Nothing became ready (includes signal interruption).
	Timeout,
	/// At least one handler ran.
	EventHandled,
	/// Descriptors woke the poll but no registered handler matched.
	NoEvents,
}

/// What a handler asks the dispatcher to do once the pass is over.
pub enum Action<C> {
	Continue,
	/// Drop this entry.  Closing the descriptor is the owner's business.
	RemoveSelf,
	/// Register another descriptor (0 events means read-ready).
	Add(RawFd, i16, Handlers<C>),
}

pub type ReadyFn<C> = Box<dyn FnMut(&mut C) -> Action<C>>;
pub type ErrorFn<C> = Box<dyn FnMut(&mut C, DispatchError) -> Action<C>>;
pub type ReindexFn<C> = Box<dyn FnMut(&mut C, usize)>;

/// Callbacks attached to one descriptor.  The reindex callback reports the
/// entry's slot at insertion and again whenever a removal compacts the set,
/// so owners can keep a live reference to their entry.
pub struct Handlers<C> {
	ready: Option<ReadyFn<C>>,
	error: Option<ErrorFn<C>>,
	reindex: Option<ReindexFn<C>>,
}

impl<C> Handlers<C> {
	pub fn new() -> Handlers<C> {
		Handlers {
			ready: None,
			error: None,
			reindex: None,
		}
	}

	pub fn on_ready(mut self, f: impl FnMut(&mut C) -> Action<C> + 'static) -> Handlers<C> {
		self.ready = Some(Box::new(f));
		self
	}

	pub fn on_error(
		mut self,
		f: impl FnMut(&mut C, DispatchError) -> Action<C> + 'static,
	) -> Handlers<C> {
		self.error = Some(Box::new(f));
		self
	}

	pub fn on_reindex(mut self, f: impl FnMut(&mut C, usize) + 'static) -> Handlers<C> {
		self.reindex = Some(Box::new(f));
		self
	}
}

/// Parallel arrays of poll descriptors and their handlers.
pub struct Dispatcher<C> {
	fds: Vec<libc::pollfd>,
	entries: Vec<Handlers<C>>,
}

impl<C> Dispatcher<C> {
	pub fn new() -> Dispatcher<C> {
		Dispatcher {
			fds: Vec::new(),
			entries: Vec::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.fds.len()
	}

	pub fn is_empty(&self) -> bool {
		self.fds.is_empty()
	}

	/// The descriptor currently stored at `index`, if any.
	pub fn fd_at(&self, index: usize) -> Option<RawFd> {
		self.fds.get(index).map(|p| p.fd)
	}

	/// Register a descriptor.  `events` of 0 means read-ready.  Returns
	/// the entry's slot, which the reindex callback also reports.
	pub fn add(&mut self, ctx: &mut C, fd: RawFd, events: i16, mut handlers: Handlers<C>) -> usize {
		let events = if events == 0 { libc::POLLIN } else { events };
		debug!("adding fd {} to the poll set (events {:#x})", fd, events);
		let index = self.fds.len();
		self.fds.push(libc::pollfd {
			fd,
			events,
			revents: 0,
		});
		if let Some(reindex) = handlers.reindex.as_mut() {
			reindex(ctx, index);
		}
		self.entries.push(handlers);
		index
	}

	/// Drop the entry at `index`.  The last entry takes its place and is
	/// told about its new slot.
	pub fn remove(&mut self, ctx: &mut C, index: usize) {
		if index >= self.fds.len() {
			return;
		}
		debug!("removing fd {} from the poll set", self.fds[index].fd);
		self.fds.swap_remove(index);
		self.entries.swap_remove(index);
		if index < self.entries.len() {
			if let Some(reindex) = self.entries[index].reindex.as_mut() {
				reindex(ctx, index);
			}
		}
	}

	/// Drop every entry registered for `fd`.
	pub fn remove_by_fd(&mut self, ctx: &mut C, fd: RawFd) {
		let mut index = 0;
		while index < self.fds.len() {
			if self.fds[index].fd == fd {
				self.remove(ctx, index);
			} else {
				index += 1;
			}
		}
	}

	/// One poll pass.  `None` blocks indefinitely.  For each ready entry
	/// exactly one handler fires, in priority order: invalid descriptor,
	/// poll error, hangup, readiness.
	pub fn run(&mut self, ctx: &mut C, timeout: Option<Duration>) -> io::Result<RunStatus> {
		let timeout_ms = match timeout {
			Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as libc::c_int,
			None => -1,
		};
		let ready = unsafe {
			libc::poll(
				self.fds.as_mut_ptr(),
				self.fds.len() as libc::nfds_t,
				timeout_ms,
			)
		};
		if ready < 0 {
			let err = io::Error::last_os_error();
			if err.raw_os_error() == Some(libc::EINTR) {
				return Ok(RunStatus::Timeout);
			}
			return Err(err);
		}
		if ready == 0 {
			return Ok(RunStatus::Timeout);
		}

		let mut handled = false;
		let mut removals: Vec<usize> = Vec::new();
		let mut additions: Vec<(RawFd, i16, Handlers<C>)> = Vec::new();
		for index in 0..self.fds.len() {
			let libc::pollfd {
				fd,
				events,
				revents,
			} = self.fds[index];
			if revents == 0 {
				continue;
			}
			debug!("events on fd {}: {:#x}", fd, revents);
			let action = if revents & libc::POLLNVAL != 0 {
				self.entries[index]
					.error
					.as_mut()
					.map(|f| f(ctx, DispatchError::InvalidFd))
			} else if revents & libc::POLLERR != 0 {
				self.entries[index]
					.error
					.as_mut()
					.map(|f| f(ctx, DispatchError::PollError))
			} else if revents & libc::POLLHUP != 0 {
				self.entries[index]
					.error
					.as_mut()
					.map(|f| f(ctx, DispatchError::Closed))
			} else if revents & events != 0 {
				self.entries[index].ready.as_mut().map(|f| f(ctx))
			} else {
				None
			};
			if let Some(action) = action {
				handled = true;
				match action {
					Action::Continue => {}
					Action::RemoveSelf => removals.push(index),
					Action::Add(fd, events, handlers) => additions.push((fd, events, handlers)),
				}
			}
		}

		// Highest index first, so pending removal positions stay valid
		// while swap_remove compacts the arrays.
		removals.sort_unstable();
		for index in removals.into_iter().rev() {
			self.remove(ctx, index);
		}
		for (fd, events, handlers) in additions {
			self.add(ctx, fd, events, handlers);
		}

		Ok(if handled {
			RunStatus::EventHandled
		} else {
			RunStatus::NoEvents
		})
	}
}
