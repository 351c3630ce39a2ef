//! Self-pipe wakeup.
//!
//! Signal handlers may only touch async-signal-safe machinery, so they
//! restrict themselves to atomic flags and a single `write` into a socket
//! pair whose read end sits in the dispatcher.  The main loop observes the
//! flags once the poll wakes up.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use log::error;

use crate::dispatch::{Action, Dispatcher, Handlers};

static RUNNING: AtomicBool = AtomicBool::new(true);
static REOPEN_LOG: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// A connected socket pair used to wake the dispatcher from signal
/// handlers (or from anywhere else).
pub struct Notifier {
	sockets: [RawFd; 2],
}

impl Notifier {
	pub fn new() -> io::Result<Notifier> {
		let mut sockets = [0 as RawFd; 2];
		let rc = unsafe {
			libc::socketpair(
				libc::PF_LOCAL,
				libc::SOCK_STREAM,
				0,
				sockets.as_mut_ptr(),
			)
		};
		if rc != 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(Notifier { sockets })
	}

	pub fn read_fd(&self) -> RawFd {
		self.sockets[0]
	}

	/// Register the read end with the dispatcher.  The handler only drains
	/// the pipe; whoever woke us left its reason in the flags.
	pub fn register<C>(&self, ctx: &mut C, dispatcher: &mut Dispatcher<C>) {
		let fd = self.read_fd();
		dispatcher.add(
			ctx,
			fd,
			0,
			Handlers::new().on_ready(move |_ctx: &mut C| {
				let mut dummy = [0u8; 1];
				let rd = unsafe { libc::read(fd, dummy.as_mut_ptr() as *mut libc::c_void, 1) };
				if rd < 0 {
					error!("error draining the wakeup pipe");
				}
				Action::Continue
			}),
		);
	}

	pub fn notify(&self) {
		write_wake_byte(self.sockets[1]);
	}
}

impl Drop for Notifier {
	fn drop(&mut self) {
		WAKE_FD.store(-1, Ordering::SeqCst);
		unsafe {
			libc::close(self.sockets[0]);
			libc::close(self.sockets[1]);
		}
	}
}

fn write_wake_byte(fd: RawFd) {
	let dummy = [0u8; 1];
	unsafe { libc::write(fd, dummy.as_ptr() as *const libc::c_void, 1) };
}

/// Whether the main loop should keep going.
pub fn running() -> bool {
	RUNNING.load(Ordering::SeqCst)
}

/// Ask the main loop to wind down (not signal-context; use freely).
pub fn request_stop() {
	RUNNING.store(false, Ordering::SeqCst);
	wake_from_signal();
}

/// True once per SIGHUP: the logfile should be reopened.
pub fn take_reopen_request() -> bool {
	REOPEN_LOG.swap(false, Ordering::SeqCst)
}

/// Install the daemon's signal dispositions.  SIGINT/SIGTERM stop the
/// loop; a second one while already stopping kills the process outright.
/// SIGHUP requests a logfile reopen.  SIGPIPE is ignored so client writes
/// fail with an error instead of killing us.
pub fn install_signal_handlers(notifier: &Notifier) {
	WAKE_FD.store(notifier.sockets[1], Ordering::SeqCst);
	let shutdown: extern "C" fn(libc::c_int) = handle_shutdown_signal;
	let hup: extern "C" fn(libc::c_int) = handle_hup_signal;
	unsafe {
		libc::signal(libc::SIGTERM, shutdown as libc::sighandler_t);
		libc::signal(libc::SIGINT, shutdown as libc::sighandler_t);
		libc::signal(libc::SIGHUP, hup as libc::sighandler_t);
		libc::signal(libc::SIGPIPE, libc::SIG_IGN);
	}
}

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
	if RUNNING.swap(false, Ordering::SeqCst) {
		wake_from_signal();
	} else {
		// A second signal while shutdown is already underway: stop
		// waiting for anything and go down hard.
		unsafe {
			libc::kill(libc::getpid(), libc::SIGKILL);
		}
	}
}

extern "C" fn handle_hup_signal(_sig: libc::c_int) {
	REOPEN_LOG.store(true, Ordering::SeqCst);
	wake_from_signal();
}

fn wake_from_signal() {
	let fd = WAKE_FD.load(Ordering::SeqCst);
	if fd >= 0 {
		write_wake_byte(fd);
	}
}
