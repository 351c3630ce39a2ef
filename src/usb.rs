//! The libusb transport behind the engine.
//!
//! Transfers are submitted asynchronously through the raw `rusb::ffi`
//! bindings; their completion callbacks run inside
//! `libusb_handle_events_timeout`, which the dispatcher invokes whenever a
//! libusb descriptor becomes ready.  A callback does as little as possible:
//! it records the status, pushes a [Completion] into the mailbox and frees
//! the transfer.  Everything stateful happens later, on the dispatcher
//! thread, when the engine drains the mailbox.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::os::raw::{c_int, c_short, c_uint};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use log::{debug, info, warn};
use rusb::constants::{
	LIBUSB_ENDPOINT_DIR_MASK, LIBUSB_ENDPOINT_IN, LIBUSB_ERROR_ACCESS, LIBUSB_ERROR_BUSY,
	LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_INVALID_PARAM, LIBUSB_ERROR_IO,
	LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_NOT_SUPPORTED, LIBUSB_ERROR_NO_DEVICE,
	LIBUSB_ERROR_NO_MEM, LIBUSB_ERROR_OVERFLOW, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT,
	LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
	LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
};
use rusb::ffi;
use rusb::{Context, Device, DeviceHandle, UsbContext};

use dali_core::{Completion, Error as DaliError, Transport, TransferStatus, MESSAGE_LENGTH};

pub const VENDOR_ID: u16 = 0x17b5;
pub const PRODUCT_ID: u16 = 0x0020;
const CONFIGURATION_VALUE: u8 = 1;

/// Default per-transfer timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// A change in the set of descriptors libusb wants polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdChange {
	Added(RawFd, i16),
	Removed(RawFd),
}

type Mailbox = Arc<Mutex<VecDeque<Completion>>>;
type FdChanges = Arc<Mutex<VecDeque<FdChange>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
	Send,
	Receive,
}

struct TransferPtr(NonNull<ffi::libusb_transfer>);

// Shared with the completion callback, and only ever dereferenced under
// the state mutex while `done` is false.
unsafe impl Send for TransferPtr {}

struct TransferState {
	ptr: TransferPtr,
	buffer: Box<[u8; MESSAGE_LENGTH]>,
	done: bool,
}

/// Handle to a submitted transfer.  Cancellation races against completion;
/// the `done` flag decides who still owns the libusb side.
struct PendingTransfer {
	state: Arc<Mutex<TransferState>>,
}

impl PendingTransfer {
	fn cancel(&self) {
		let state = self.state.lock().unwrap();
		if !state.done {
			unsafe {
				ffi::libusb_cancel_transfer(state.ptr.0.as_ptr());
			}
		}
	}
}

struct CallbackData {
	kind: TransferKind,
	state: Arc<Mutex<TransferState>>,
	mailbox: Mailbox,
}

extern "system" fn transfer_finished(transfer: *mut ffi::libusb_transfer) {
	if transfer.is_null() {
		return;
	}
	let user_data = unsafe { (*transfer).user_data };
	if user_data.is_null() {
		return;
	}
	// Reclaim the context handed over at fill time.
	let data = unsafe { Box::from_raw(user_data as *mut CallbackData) };
	let status = map_transfer_status(unsafe { (*transfer).status });
	let completion = {
		let mut state = data.state.lock().unwrap();
		state.done = true;
		match data.kind {
			TransferKind::Send => Completion::Send(status),
			TransferKind::Receive => {
				let payload = if status == TransferStatus::Completed {
					Some(*state.buffer)
				} else {
					None
				};
				Completion::Receive(status, payload)
			}
		}
	};
	unsafe {
		ffi::libusb_free_transfer(transfer);
	}
	data.mailbox.lock().unwrap().push_back(completion);
}

extern "system" fn pollfd_added(fd: c_int, events: c_short, user_data: *mut c_void) {
	if user_data.is_null() {
		return;
	}
	let changes = unsafe { &*(user_data as *const FdChanges) };
	changes
		.lock()
		.unwrap()
		.push_back(FdChange::Added(fd, events));
}

extern "system" fn pollfd_removed(fd: c_int, user_data: *mut c_void) {
	if user_data.is_null() {
		return;
	}
	let changes = unsafe { &*(user_data as *const FdChanges) };
	changes.lock().unwrap().push_back(FdChange::Removed(fd));
}

fn map_transfer_status(status: c_int) -> TransferStatus {
	match status {
		LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
		LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
		LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
		LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
		LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
		LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
		_ => TransferStatus::Error,
	}
}

fn libusb_error_str(error: c_int) -> &'static str {
	match error {
		LIBUSB_ERROR_IO => "I/O error",
		LIBUSB_ERROR_INVALID_PARAM => "Invalid parameter",
		LIBUSB_ERROR_ACCESS => "Access error",
		LIBUSB_ERROR_NO_DEVICE => "No device",
		LIBUSB_ERROR_NOT_FOUND => "Not found",
		LIBUSB_ERROR_BUSY => "Busy",
		LIBUSB_ERROR_TIMEOUT => "Timeout",
		LIBUSB_ERROR_OVERFLOW => "Overflow",
		LIBUSB_ERROR_PIPE => "Pipe error",
		LIBUSB_ERROR_INTERRUPTED => "Interrupted",
		LIBUSB_ERROR_NO_MEM => "No memory",
		LIBUSB_ERROR_NOT_SUPPORTED => "Not supported",
		_ => "Other error",
	}
}

/// The DALI USB adapter, claimed and ready for interrupt transfers.
pub struct UsbBus {
	context: Context,
	handle: DeviceHandle<Context>,
	endpoint_in: u8,
	endpoint_out: u8,
	timeout: Duration,
	reattach_kernel_driver: bool,
	mailbox: Mailbox,
	fd_changes: FdChanges,
	send: Option<PendingTransfer>,
	recv: Option<PendingTransfer>,
	device_gone: bool,
}

impl UsbBus {
	/// Find, open and claim the adapter.  `selector` pins a specific
	/// bus:device pair; otherwise the first device matching the well-known
	/// vendor and product ids wins.
	pub fn open(selector: Option<(u8, u8)>, timeout: Duration) -> Result<UsbBus> {
		let context = Context::new().context("initializing libusb")?;
		let device = find_device(&context, selector)?;
		debug!(
			"using device on bus {:03} address {:03}",
			device.bus_number(),
			device.address()
		);

		let config = config_by_value(&device, CONFIGURATION_VALUE)?;
		if config.num_interfaces() != 1 {
			bail!(
				"need exactly one interface, got {}",
				config.num_interfaces()
			);
		}
		let interface = config
			.interfaces()
			.next()
			.ok_or_else(|| anyhow!("interface list is empty"))?;
		let settings: Vec<_> = interface.descriptors().collect();
		if settings.len() != 1 {
			bail!("need exactly one altsetting, got {}", settings.len());
		}
		let setting = &settings[0];
		if setting.num_endpoints() != 2 {
			bail!("need exactly two endpoints, got {}", setting.num_endpoints());
		}
		let addresses: Vec<u8> = setting.endpoint_descriptors().map(|e| e.address()).collect();
		let (endpoint_in, endpoint_out) =
			if addresses[0] & LIBUSB_ENDPOINT_DIR_MASK == LIBUSB_ENDPOINT_IN {
				(addresses[0], addresses[1])
			} else {
				(addresses[1], addresses[0])
			};
		debug!("input endpoint: {:#04x}", endpoint_in);
		debug!("output endpoint: {:#04x}", endpoint_out);
		drop(config);

		let mut handle = device.open().context("opening device")?;
		let mut reattach_kernel_driver = false;
		if handle
			.kernel_driver_active(0)
			.context("querying kernel driver state")?
		{
			info!("kernel driver is active, trying to detach");
			handle
				.detach_kernel_driver(0)
				.context("detaching kernel driver")?;
			reattach_kernel_driver = true;
		}
		handle
			.set_active_configuration(CONFIGURATION_VALUE)
			.context("setting configuration")?;
		handle.claim_interface(0).context("claiming interface")?;
		handle
			.set_alternate_setting(0, 0)
			.context("assigning altsetting")?;

		let fd_changes: FdChanges = Arc::new(Mutex::new(VecDeque::new()));
		// The notifier context stays registered until the libusb context
		// dies, and libusb reports fd removals from inside libusb_exit;
		// the allocation is deliberately left to the process.
		let notifier_ctx = Box::into_raw(Box::new(fd_changes.clone()));
		unsafe {
			ffi::libusb_set_pollfd_notifiers(
				context.as_raw(),
				Some(pollfd_added),
				Some(pollfd_removed),
				notifier_ctx as *mut c_void,
			);
		}

		Ok(UsbBus {
			context,
			handle,
			endpoint_in,
			endpoint_out,
			timeout,
			reattach_kernel_driver,
			mailbox: Arc::new(Mutex::new(VecDeque::new())),
			fd_changes,
			send: None,
			recv: None,
			device_gone: false,
		})
	}

	/// True once any transfer reported `NoDevice`.  There is no recovery;
	/// the daemon shuts down.
	pub fn device_gone(&self) -> bool {
		self.device_gone
	}

	/// The descriptors libusb currently wants in the poll set.
	pub fn pollfds(&self) -> Result<Vec<(RawFd, i16)>> {
		let list = unsafe { ffi::libusb_get_pollfds(self.context.as_raw()) };
		if list.is_null() {
			bail!("libusb did not hand out poll descriptors");
		}
		let mut fds = Vec::new();
		unsafe {
			let mut cursor = list;
			while !(*cursor).is_null() {
				fds.push(((**cursor).fd, (**cursor).events));
				cursor = cursor.offset(1);
			}
			ffi::libusb_free_pollfds(list);
		}
		Ok(fds)
	}

	/// Changes to the poll set reported by libusb since the last call.
	pub fn take_fd_changes(&self) -> Vec<FdChange> {
		self.fd_changes.lock().unwrap().drain(..).collect()
	}

	/// How long until libusb needs a timeout pass, if it is keeping one.
	pub fn next_timeout(&self) -> Option<Duration> {
		let mut tv = libc::timeval {
			tv_sec: 0,
			tv_usec: 0,
		};
		let rc = unsafe { ffi::libusb_get_next_timeout(self.context.as_raw(), &mut tv) };
		if rc == 1 {
			Some(Duration::new(tv.tv_sec as u64, tv.tv_usec as u32 * 1000))
		} else {
			None
		}
	}

	/// One zero-timeout event pass; runs any due transfer callbacks.
	pub fn handle_events(&self) {
		let mut tv = libc::timeval {
			tv_sec: 0,
			tv_usec: 0,
		};
		let rc = unsafe { ffi::libusb_handle_events_timeout(self.context.as_raw(), &mut tv) };
		if rc != 0 {
			warn!("error handling USB events: {}", libusb_error_str(rc));
		}
	}

	fn submit_transfer(
		&self,
		kind: TransferKind,
		endpoint: u8,
		buffer: Box<[u8; MESSAGE_LENGTH]>,
	) -> Result<PendingTransfer, DaliError> {
		let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
		let transfer = NonNull::new(transfer)
			.ok_or_else(|| DaliError::Transport("allocating transfer failed".into()))?;
		let state = Arc::new(Mutex::new(TransferState {
			ptr: TransferPtr(transfer),
			buffer,
			done: false,
		}));
		let data = Box::new(CallbackData {
			kind,
			state: state.clone(),
			mailbox: self.mailbox.clone(),
		});
		{
			let mut locked = state.lock().unwrap();
			let buffer_ptr = locked.buffer.as_mut_ptr();
			unsafe {
				ffi::libusb_fill_interrupt_transfer(
					transfer.as_ptr(),
					self.handle.as_raw(),
					endpoint,
					buffer_ptr,
					MESSAGE_LENGTH as c_int,
					transfer_finished,
					Box::into_raw(data) as *mut c_void,
					self.timeout.as_millis() as c_uint,
				);
			}
		}
		let rc = unsafe { ffi::libusb_submit_transfer(transfer.as_ptr()) };
		if rc != 0 {
			// The callback never runs for a failed submit; take the
			// context back and release the transfer here.
			unsafe {
				let user_data = (*transfer.as_ptr()).user_data;
				drop(Box::from_raw(user_data as *mut CallbackData));
				ffi::libusb_free_transfer(transfer.as_ptr());
			}
			state.lock().unwrap().done = true;
			return Err(DaliError::Transport(format!(
				"submitting transfer failed: {}",
				libusb_error_str(rc)
			)));
		}
		Ok(PendingTransfer { state })
	}
}

impl Transport for UsbBus {
	fn submit_send(&mut self, message: [u8; MESSAGE_LENGTH]) -> Result<(), DaliError> {
		let pending = self.submit_transfer(TransferKind::Send, self.endpoint_out, Box::new(message))?;
		self.send = Some(pending);
		Ok(())
	}

	fn submit_receive(&mut self) -> Result<(), DaliError> {
		let pending = self.submit_transfer(
			TransferKind::Receive,
			self.endpoint_in,
			Box::new([0u8; MESSAGE_LENGTH]),
		)?;
		self.recv = Some(pending);
		Ok(())
	}

	fn cancel_receive(&mut self) {
		if let Some(recv) = self.recv.as_ref() {
			recv.cancel();
		}
	}

	fn poll_completions(&mut self) -> Vec<Completion> {
		let completions: Vec<Completion> = self.mailbox.lock().unwrap().drain(..).collect();
		for completion in &completions {
			let status = match completion {
				Completion::Send(status) => {
					self.send = None;
					status
				}
				Completion::Receive(status, _) => {
					self.recv = None;
					status
				}
			};
			if *status == TransferStatus::NoDevice {
				self.device_gone = true;
			}
		}
		completions
	}
}

impl Drop for UsbBus {
	fn drop(&mut self) {
		if let Some(send) = self.send.take() {
			send.cancel();
		}
		if let Some(recv) = self.recv.take() {
			recv.cancel();
		}
		// One pass to drain the cancel callbacks before the handle goes.
		self.handle_events();

		if let Err(err) = self.handle.release_interface(0) {
			debug!("error releasing interface: {}", err);
		}
		if self.reattach_kernel_driver {
			info!("reattaching kernel driver");
			if let Err(err) = self.handle.attach_kernel_driver(0) {
				warn!("error reattaching interface: {}", err);
			}
		}
	}
}

fn find_device(context: &Context, selector: Option<(u8, u8)>) -> Result<Device<Context>> {
	let devices = context.devices().context("listing USB devices")?;
	match selector {
		Some((bus, address)) => devices
			.iter()
			.find(|d| d.bus_number() == bus && d.address() == address)
			.ok_or_else(|| anyhow!("no USB device at {}:{}", bus, address)),
		None => devices
			.iter()
			.find(|d| {
				d.device_descriptor()
					.map(|desc| {
						desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID
					})
					.unwrap_or(false)
			})
			.ok_or_else(|| {
				anyhow!(
					"can't find USB device {:04x}:{:04x}",
					VENDOR_ID,
					PRODUCT_ID
				)
			}),
	}
}

fn config_by_value(device: &Device<Context>, value: u8) -> Result<rusb::ConfigDescriptor> {
	let descriptor = device.device_descriptor().context("reading device descriptor")?;
	for index in 0..descriptor.num_configurations() {
		let config = device
			.config_descriptor(index)
			.context("reading configuration descriptor")?;
		if config.number() == value {
			return Ok(config);
		}
	}
	bail!("device has no configuration {}", value);
}
