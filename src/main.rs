//! daliserver: multiplexes one DALI bus on a USB adapter across many TCP
//! clients.
//!
//! Everything runs on one thread.  The dispatcher polls the listener, the
//! client sockets, libusb's descriptors and the signal wakeup pipe; the
//! handlers call into the engine and the multiplexer, and neither ever
//! blocks.

mod config;
mod daemon;
mod dispatch;
mod logging;
mod mux;
mod notifier;
mod server;
mod usb;

use std::os::unix::io::RawFd;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};

use dali_core::Engine;

use crate::config::Options;
use crate::daemon::PidFile;
use crate::dispatch::{Action, DispatchError, Dispatcher, Handlers, RunStatus};
use crate::notifier::Notifier;
use crate::server::{ClientId, Server};
use crate::usb::{FdChange, UsbBus, DEFAULT_COMMAND_TIMEOUT};

/// Upper bound on one poll pass, libusb timeout or not.
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Everything the dispatcher handlers operate on.
pub struct App {
	/// `None` in dry-run operation.
	pub engine: Option<Engine<UsbBus, ClientId>>,
	pub server: Server,
	/// Poll entries to drop once the current handler pass is over
	/// (connections torn down from inside other handlers).  Descriptor
	/// plus its last reported poll slot.
	pub defunct: Vec<(RawFd, usize)>,
}

impl App {
	/// Tear a connection down from anywhere: detach it from the engine,
	/// drop it from the table and queue its poll entry for removal.
	pub fn fail_connection(&mut self, id: ClientId) {
		if let Some(engine) = self.engine.as_mut() {
			engine.cancel_origin(id);
		}
		let poll_index = self
			.server
			.connection_mut(id)
			.map(|connection| connection.poll_index);
		if let Some(fd) = self.server.close(id) {
			self.defunct.push((fd, poll_index.unwrap_or(usize::MAX)));
		}
	}
}

fn main() {
	let options = Options::parse();
	if let Err(err) = run(options) {
		log::error!("{:#}", err);
		eprintln!("daliserver: {:#}", err);
		std::process::exit(1);
	}
}

fn run(options: Options) -> Result<()> {
	if options.daemonize {
		daemon::daemonize().context("detaching from terminal")?;
	}
	logging::init(&options).context("setting up logging")?;
	info!("starting daliserver");

	let _pid_file = if options.daemonize {
		Some(PidFile::create(&options.pid_file)?)
	} else {
		None
	};

	let mut dispatcher: Dispatcher<App> = Dispatcher::new();

	debug!("initializing USB connection");
	let engine = if options.dry_run {
		info!("dry-run: not opening a USB adapter");
		None
	} else {
		let bus = UsbBus::open(options.usb_device, DEFAULT_COMMAND_TIMEOUT)
			.context("opening the DALI USB adapter")?;
		Some(Engine::new(bus))
	};

	debug!("initializing server");
	let server = Server::open(options.listen_address, options.port)
		.context("opening the listening socket")?;

	debug!("creating shutdown notifier");
	let notifier = Notifier::new().context("creating the wakeup pipe")?;

	let mut app = App {
		engine,
		server,
		defunct: Vec::new(),
	};

	let listener_fd = app.server.listener_fd();
	dispatcher.add(&mut app, listener_fd, 0, listener_handlers());
	if let Some(engine) = app.engine.as_ref() {
		for (fd, events) in engine.transport().pollfds()? {
			dispatcher.add(&mut app, fd, events, usb_handlers());
		}
	}
	notifier.register(&mut app, &mut dispatcher);
	notifier::install_signal_handlers(&notifier);

	// Post the idle receive so bus traffic is picked up from the start.
	if let Some(engine) = app.engine.as_mut() {
		engine.pump();
	}
	mux::drain_engine(&mut app);

	info!("server ready, waiting for events");
	while notifier::running() {
		let timeout = app
			.engine
			.as_ref()
			.and_then(|engine| engine.transport().next_timeout())
			.map(|timeout| timeout.min(MAX_POLL_TIMEOUT))
			.unwrap_or(MAX_POLL_TIMEOUT);
		match dispatcher.run(&mut app, Some(timeout)) {
			Ok(RunStatus::Timeout) => {
				// libusb transfer timeouts fire from the event pass, so
				// give it one even when no descriptor woke us.
				if let Some(engine) = app.engine.as_ref() {
					engine.transport().handle_events();
				}
				mux::drain_engine(&mut app);
			}
			Ok(_) => {}
			Err(err) => {
				// Anything but EINTR out of poll is unrecoverable.
				error!("error waiting for I/O events: {}", err);
				bail!("dispatcher failed: {}", err);
			}
		}

		if notifier::take_reopen_request() {
			logging::reopen();
		}

		let mut defunct: Vec<(RawFd, usize)> = app.defunct.drain(..).collect();
		// Highest slot first: removing an entry never shifts the entries
		// below it, so the remaining recorded slots stay good.
		defunct.sort_unstable_by(|a, b| b.1.cmp(&a.1));
		for (fd, index) in defunct {
			// The recorded slot is current as of the reindex callbacks;
			// verify it before the O(1) removal, fall back to a scan.
			if dispatcher.fd_at(index) == Some(fd) {
				dispatcher.remove(&mut app, index);
			} else {
				dispatcher.remove_by_fd(&mut app, fd);
			}
		}

		let changes = app
			.engine
			.as_ref()
			.map(|engine| engine.transport().take_fd_changes())
			.unwrap_or_default();
		for change in changes {
			match change {
				FdChange::Added(fd, events) => {
					dispatcher.add(&mut app, fd, events, usb_handlers());
				}
				FdChange::Removed(fd) => dispatcher.remove_by_fd(&mut app, fd),
			}
		}

		if notifier::running()
			&& app
				.engine
				.as_ref()
				.map(|engine| engine.transport().device_gone())
				.unwrap_or(false)
		{
			error!("USB adapter is gone, shutting down");
			notifier::request_stop();
		}
	}

	info!("shutting daliserver down");
	for id in app.server.client_ids() {
		app.fail_connection(id);
	}
	// Dropping the engine cancels outstanding transfers and releases the
	// adapter; dropping the server closes the listener.
	drop(app);
	drop(dispatcher);

	info!("exiting");
	Ok(())
}

fn listener_handlers() -> Handlers<App> {
	Handlers::new()
		.on_ready(|app: &mut App| match app.server.accept() {
			Some((id, fd)) => Action::Add(fd, 0, connection_handlers(id)),
			None => Action::Continue,
		})
		.on_error(|_app: &mut App, err: DispatchError| {
			error!("listener failed: {:?}", err);
			notifier::request_stop();
			Action::Continue
		})
}

fn connection_handlers(id: ClientId) -> Handlers<App> {
	// Teardown always goes through `fail_connection`, which queues the
	// poll entry on the defunct list; the entry stays put until the end
	// of the pass, so its recorded slot identifies it exactly.
	Handlers::new()
		.on_ready(move |app: &mut App| {
			match app.server.read_frame(id) {
				Some(frame) => mux::handle_frame(app, id, frame),
				None => app.fail_connection(id),
			}
			Action::Continue
		})
		.on_error(move |app: &mut App, err: DispatchError| {
			debug!("connection error: {:?}", err);
			app.fail_connection(id);
			Action::Continue
		})
		.on_reindex(move |app: &mut App, index| {
			if let Some(connection) = app.server.connection_mut(id) {
				connection.poll_index = index;
			}
		})
}

fn usb_handlers() -> Handlers<App> {
	Handlers::new()
		.on_ready(|app: &mut App| {
			if let Some(engine) = app.engine.as_ref() {
				engine.transport().handle_events();
			}
			mux::drain_engine(app);
			Action::Continue
		})
		.on_error(|_app: &mut App, err: DispatchError| match err {
			DispatchError::InvalidFd => {
				// libusb closed the descriptor underneath us; the removal
				// notification is already queued.
				debug!("dropping stale USB poll entry");
				Action::RemoveSelf
			}
			other => {
				warn!("poll error on a USB descriptor: {:?}", other);
				Action::Continue
			}
		})
}
