//! The bus transaction engine.
//!
//! A single DALI adapter is shared by many clients, but it can run only one
//! request at a time: the host posts an interrupt OUT transfer, then listens
//! on the interrupt IN endpoint until the adapter echoes the request's
//! sequence number back.  While nothing is being sent, an idle IN transfer
//! stays posted so unsolicited bus traffic is picked up and can be fanned
//! out to subscribers.
//!
//! The engine owns the request queue and the bookkeeping for the one active
//! transaction.  It talks to the hardware through the [Transport] trait and
//! reports everything worth delivering as [Event] values, which keeps it
//! free of I/O and lets tests drive it with a scripted transport.

use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::error::Error;
use crate::frame::DaliFrame;
use crate::msg::{DeviceMessage, Direction, HostMessage, Kind, MESSAGE_LENGTH};

/// Default bound on the number of queued requests.
pub const DEFAULT_QUEUE_LIMIT: usize = 255;

/// Terminal state of one submitted transfer.  Mirrors the libusb transfer
/// statuses one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
	Completed,
	TimedOut,
	Cancelled,
	Error,
	Stall,
	NoDevice,
	Overflow,
}

/// One finished transfer, as reported by the transport.
///
/// A receive completion carries the transfer buffer only when data actually
/// arrived; timeouts, cancellations and errors come without a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
	Send(TransferStatus),
	Receive(TransferStatus, Option<[u8; MESSAGE_LENGTH]>),
}

/// The device side of the engine: something that can run one interrupt
/// transfer in each direction and report their completions later.
///
/// At most one send and one receive transfer are in flight at any time; the
/// engine guarantees it never double-submits.  `cancel_receive` must be
/// asynchronous: the cancelled transfer still terminates through
/// `poll_completions` with [TransferStatus::Cancelled].
pub trait Transport {
	fn submit_send(&mut self, message: [u8; MESSAGE_LENGTH]) -> Result<(), Error>;
	fn submit_receive(&mut self) -> Result<(), Error>;
	fn cancel_receive(&mut self);
	fn poll_completions(&mut self) -> Vec<Completion>;
}

/// How one client request ended, or progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	/// The adapter forwarded the answer frame.  The transaction is still
	/// open; a completion follows.
	Response { frame: DaliFrame, status: u16 },
	/// The adapter marked the transaction finished.
	Completed { status: u16 },
	SendTimeout,
	ReceiveTimeout,
	SendError,
	ReceiveError,
}

/// A delivery the engine wants made after a batch of completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<H> {
	/// In-band: an update for the client that issued a request.  `origin`
	/// is `None` when that client has been cancelled in the meantime.
	Request {
		origin: Option<H>,
		request: DaliFrame,
		outcome: Outcome,
	},
	/// Out-of-band: a frame that appeared on the bus unsolicited.
	Broadcast { frame: DaliFrame, status: u16 },
	/// Out-of-band: the idle receive failed hard.
	BroadcastError,
}

struct Transaction<H> {
	seq_num: u8,
	request: DaliFrame,
	origin: Option<H>,
}

/// The transfer state machine for one adapter.
///
/// `H` is the handle type identifying a request's originator; the engine
/// only ever copies and compares it.
pub struct Engine<T, H> {
	transport: T,
	queue: VecDeque<Transaction<H>>,
	queue_limit: usize,
	active: Option<Transaction<H>>,
	send_pending: bool,
	recv_pending: bool,
	seq_num: u8,
	events: Vec<Event<H>>,
}

impl<T: Transport, H: Copy + PartialEq> Engine<T, H> {
	pub fn new(transport: T) -> Engine<T, H> {
		Engine {
			transport,
			queue: VecDeque::new(),
			queue_limit: DEFAULT_QUEUE_LIMIT,
			active: None,
			send_pending: false,
			recv_pending: false,
			// The adapter reports unsolicited traffic with sequence
			// number zero, so zero is never assigned to a request.
			seq_num: 1,
			events: Vec::new(),
		}
	}

	pub fn with_queue_limit(transport: T, limit: usize) -> Result<Engine<T, H>, Error> {
		if limit == 0 {
			return Err(Error::InvalidArg("queue limit must be nonzero"));
		}
		let mut engine = Engine::new(transport);
		engine.queue_limit = limit;
		Ok(engine)
	}

	pub fn transport(&self) -> &T {
		&self.transport
	}

	pub fn transport_mut(&mut self) -> &mut T {
		&mut self.transport
	}

	/// Number of requests waiting behind the active transaction.
	pub fn queued_requests(&self) -> usize {
		self.queue.len()
	}

	pub fn has_active_transaction(&self) -> bool {
		self.active.is_some()
	}

	/// Queue a request frame for transmission.  Progress and the final
	/// outcome are reported through [Event::Request] values carrying
	/// `origin`.
	pub fn submit(&mut self, request: DaliFrame, origin: H) -> Result<(), Error> {
		if self.queue.len() >= self.queue_limit {
			return Err(Error::QueueFull);
		}
		self.queue.push_back(Transaction {
			seq_num: 0,
			request,
			origin: Some(origin),
		});
		debug!("enqueued request ({} waiting)", self.queue.len());
		self.pump();
		Ok(())
	}

	/// Forget a request originator: queued requests from it are dropped
	/// and its in-flight transaction is delivered nowhere.  The
	/// transaction itself still runs to its natural end so the sequence
	/// number bookkeeping stays sound.
	pub fn cancel_origin(&mut self, origin: H) {
		self.queue.retain(|t| t.origin != Some(origin));
		if let Some(active) = self.active.as_mut() {
			if active.origin == Some(origin) {
				debug!("detaching cancelled originator from transaction #{}", active.seq_num);
				active.origin = None;
			}
		}
	}

	/// Drain transport completions, advance the state machine and return
	/// the deliveries that resulted.
	pub fn poll_events(&mut self) -> Vec<Event<H>> {
		for completion in self.transport.poll_completions() {
			match completion {
				Completion::Send(status) => self.on_send_done(status),
				Completion::Receive(status, data) => self.on_receive_done(status, data),
			}
		}
		std::mem::take(&mut self.events)
	}

	/// One scheduling step.  Safe to call at any time; does nothing when a
	/// send is in flight.
	pub fn pump(&mut self) {
		if self.send_pending {
			return;
		}
		if self.active.is_some() {
			if !self.recv_pending {
				self.post_receive();
			}
		} else if !self.queue.is_empty() {
			if self.recv_pending {
				// The idle receive holds the endpoint; once its cancel
				// completion arrives this runs again and sends.
				debug!("cancelling idle receive before send");
				self.transport.cancel_receive();
			} else if let Some(transaction) = self.queue.pop_front() {
				self.post_send(transaction);
			}
		} else if !self.recv_pending {
			// Idle: keep listening for bus traffic.
			self.post_receive();
		}
	}

	fn post_send(&mut self, mut transaction: Transaction<H>) {
		transaction.seq_num = self.seq_num;
		self.seq_num = if self.seq_num == 0xff { 1 } else { self.seq_num + 1 };
		let message = HostMessage {
			seqnum: transaction.seq_num,
			frame: transaction.request,
		};
		debug!("sending request: {}", message);
		let packed = match message.pack() {
			Ok(packed) => packed,
			Err(err) => {
				warn!("error packing request: {}", err);
				self.events.push(Event::Request {
					origin: transaction.origin,
					request: transaction.request,
					outcome: Outcome::SendError,
				});
				return;
			}
		};
		match self.transport.submit_send(packed) {
			Ok(()) => {
				self.send_pending = true;
				self.active = Some(transaction);
			}
			Err(err) => {
				warn!("error submitting send transfer: {}", err);
				self.events.push(Event::Request {
					origin: transaction.origin,
					request: transaction.request,
					outcome: Outcome::SendError,
				});
			}
		}
	}

	fn post_receive(&mut self) {
		debug!("posting receive transfer");
		match self.transport.submit_receive() {
			Ok(()) => self.recv_pending = true,
			Err(err) => {
				warn!("error submitting receive transfer: {}", err);
				if self.active.is_some() {
					self.finish_active(Outcome::ReceiveError);
				}
			}
		}
	}

	fn finish_active(&mut self, outcome: Outcome) {
		if let Some(transaction) = self.active.take() {
			self.events.push(Event::Request {
				origin: transaction.origin,
				request: transaction.request,
				outcome,
			});
		}
	}

	fn on_send_done(&mut self, status: TransferStatus) {
		self.send_pending = false;
		debug!("send transfer finished: {:?}", status);
		match status {
			TransferStatus::Completed => {
				// The receive side terminates the transaction.
			}
			TransferStatus::TimedOut => {
				warn!("sending request to adapter timed out");
				self.finish_active(Outcome::SendTimeout);
			}
			TransferStatus::Cancelled => {}
			_ => {
				warn!("error sending request to adapter: {:?}", status);
				self.finish_active(Outcome::SendError);
			}
		}
		self.pump();
	}

	fn on_receive_done(&mut self, status: TransferStatus, data: Option<[u8; MESSAGE_LENGTH]>) {
		self.recv_pending = false;
		match status {
			TransferStatus::Completed => match data {
				Some(buffer) => match DeviceMessage::unpack(&buffer) {
					Ok(message) => self.route(message),
					Err(err) => warn!("dropping invalid message from adapter: {}", err),
				},
				None => warn!("receive transfer completed without data"),
			},
			TransferStatus::TimedOut => {
				if self.active.is_some() {
					self.finish_active(Outcome::ReceiveTimeout);
				}
				// An idle receive that timed out is simply reposted below.
			}
			TransferStatus::Cancelled => {
				// Routine: the scheduler wanted the endpoint for a send.
				debug!("receive transfer cancelled");
			}
			_ => {
				warn!("error receiving from adapter: {:?}", status);
				if self.active.is_some() {
					self.finish_active(Outcome::ReceiveError);
				} else {
					self.events.push(Event::BroadcastError);
				}
			}
		}
		self.pump();
	}

	fn route(&mut self, message: DeviceMessage) {
		debug!("received: {}", message);
		match message.direction {
			Direction::Dali => match message.kind {
				Kind::Transfer => {
					self.events.push(Event::Broadcast {
						frame: message.frame,
						status: message.status,
					});
				}
				other => {
					info!("not handling bus message of type {:?}", other);
				}
			},
			Direction::Usb => {
				let active = self
					.active
					.as_ref()
					.map(|active| (active.seq_num, active.origin, active.request));
				match active {
					Some((seq_num, origin, request)) if seq_num == message.seqnum => {
						match message.kind {
							Kind::Completion => {
								debug!(
									"transaction #{} completed with status {:#06x}",
									message.seqnum, message.status
								);
								self.finish_active(Outcome::Completed {
									status: message.status,
								});
							}
							Kind::Transfer => {
								// The answer frame; the transaction stays
								// open until its completion arrives.
								self.events.push(Event::Request {
									origin,
									request,
									outcome: Outcome::Response {
										frame: message.frame,
										status: message.status,
									},
								});
							}
							Kind::Unknown(other) => {
								info!("not handling response of unknown type {:#04x}", other);
							}
						}
					}
					Some((seq_num, _, _)) => {
						warn!(
							"got response with sequence number ({}) different from transaction ({})",
							message.seqnum, seq_num
						);
					}
					None => {
						warn!("got response while no transaction was active");
					}
				}
			}
			Direction::Unknown(other) => {
				info!("not handling message with direction {:#04x}", other);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::cell::RefCell;
	use std::rc::Rc;

	use crate::msg::{Direction, Kind};

	#[derive(Debug, PartialEq)]
	enum Op {
		Send([u8; MESSAGE_LENGTH]),
		Receive,
		CancelReceive,
	}

	#[derive(Default)]
	struct StubState {
		ops: Vec<Op>,
		completions: VecDeque<Completion>,
		send_pending: bool,
		recv_pending: bool,
		recv_cancelled: bool,
		refuse_sends: bool,
	}

	/// A scripted adapter.  It records every operation the engine asks for
	/// and hands back whatever completions the test queued up.
	#[derive(Clone, Default)]
	struct StubBus(Rc<RefCell<StubState>>);

	impl StubBus {
		fn complete_send(&self, status: TransferStatus) {
			let mut state = self.0.borrow_mut();
			assert!(state.send_pending, "no send transfer to complete");
			state.completions.push_back(Completion::Send(status));
		}

		fn complete_receive(&self, status: TransferStatus, data: Option<[u8; MESSAGE_LENGTH]>) {
			let mut state = self.0.borrow_mut();
			assert!(state.recv_pending, "no receive transfer to complete");
			state.completions.push_back(Completion::Receive(status, data));
		}

		fn deliver(&self, message: DeviceMessage) {
			self.complete_receive(TransferStatus::Completed, Some(message.pack().unwrap()));
		}

		fn sent_messages(&self) -> Vec<[u8; MESSAGE_LENGTH]> {
			self.0
				.borrow()
				.ops
				.iter()
				.filter_map(|op| match op {
					Op::Send(buffer) => Some(*buffer),
					_ => None,
				})
				.collect()
		}

		fn op_count(&self) -> usize {
			self.0.borrow().ops.len()
		}

		fn last_op_is_receive(&self) -> bool {
			matches!(self.0.borrow().ops.last(), Some(Op::Receive))
		}

		fn refuse_sends(&self, refuse: bool) {
			self.0.borrow_mut().refuse_sends = refuse;
		}
	}

	impl Transport for StubBus {
		fn submit_send(&mut self, message: [u8; MESSAGE_LENGTH]) -> Result<(), Error> {
			let mut state = self.0.borrow_mut();
			assert!(!state.send_pending, "two send transfers in flight");
			if state.refuse_sends {
				return Err(Error::Transport("stub refused the send".into()));
			}
			state.send_pending = true;
			state.ops.push(Op::Send(message));
			Ok(())
		}

		fn submit_receive(&mut self) -> Result<(), Error> {
			let mut state = self.0.borrow_mut();
			assert!(!state.recv_pending, "two receive transfers in flight");
			state.recv_pending = true;
			state.ops.push(Op::Receive);
			Ok(())
		}

		fn cancel_receive(&mut self) {
			let mut state = self.0.borrow_mut();
			if state.recv_pending && !state.recv_cancelled {
				state.recv_cancelled = true;
				state.ops.push(Op::CancelReceive);
				state
					.completions
					.push_back(Completion::Receive(TransferStatus::Cancelled, None));
			}
		}

		fn poll_completions(&mut self) -> Vec<Completion> {
			let mut state = self.0.borrow_mut();
			let completions: Vec<Completion> = state.completions.drain(..).collect();
			for completion in &completions {
				match completion {
					Completion::Send(_) => state.send_pending = false,
					Completion::Receive(..) => {
						state.recv_pending = false;
						state.recv_cancelled = false;
					}
				}
			}
			completions
		}
	}

	fn engine() -> (Engine<StubBus, u32>, StubBus) {
		let bus = StubBus::default();
		let engine = Engine::new(bus.clone());
		(engine, bus)
	}

	fn response(seqnum: u8, frame: DaliFrame, status: u16) -> DeviceMessage {
		DeviceMessage {
			direction: Direction::Usb,
			kind: Kind::Transfer,
			frame,
			status,
			seqnum,
		}
	}

	fn completion(seqnum: u8, status: u16) -> DeviceMessage {
		DeviceMessage {
			direction: Direction::Usb,
			kind: Kind::Completion,
			frame: DaliFrame::new(0, 0),
			status,
			seqnum,
		}
	}

	fn broadcast(frame: DaliFrame) -> DeviceMessage {
		DeviceMessage {
			direction: Direction::Dali,
			kind: Kind::Transfer,
			frame,
			status: 0xffff,
			seqnum: 0,
		}
	}

	/// Runs one queued request through send and reply so the engine is
	/// back at idle with the stub's idle receive posted.
	fn run_transaction(engine: &mut Engine<StubBus, u32>, bus: &StubBus, status: u16) -> Vec<Event<u32>> {
		let mut events = engine.poll_events(); // drain the idle-receive cancel
		bus.complete_send(TransferStatus::Completed);
		events.extend(engine.poll_events());
		let seq = bus.sent_messages().last().unwrap()[1];
		bus.deliver(completion(seq, status));
		events.extend(engine.poll_events());
		events
	}

	#[test]
	fn test_idle_engine_posts_receive() {
		let (mut engine, bus) = engine();
		engine.pump();
		assert!(bus.last_op_is_receive());
		assert_eq!(bus.op_count(), 1);
		// Pumping again must not double-post.
		engine.pump();
		assert_eq!(bus.op_count(), 1);
	}

	#[test]
	fn test_single_request_success() {
		let (mut engine, bus) = engine();
		engine.pump();

		let frame = DaliFrame::new(0xff, 0x00);
		engine.submit(frame, 7).unwrap();
		// The idle receive is cancelled first; the send goes out once the
		// cancel completion has been seen.
		assert!(engine.poll_events().is_empty());
		let sent = bus.sent_messages();
		assert_eq!(sent.len(), 1);
		assert_eq!(&sent[0][0..8], &[0x12, 0x01, 0x00, 0x03, 0x00, 0x00, 0xff, 0x00]);

		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());
		// A receive for the reply is now outstanding.
		assert!(bus.last_op_is_receive());

		bus.deliver(response(1, frame, 0x0000));
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(7),
				request: frame,
				outcome: Outcome::Response {
					frame,
					status: 0x0000
				},
			}]
		);
		assert!(engine.has_active_transaction());

		bus.deliver(completion(1, 0x008a));
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(7),
				request: frame,
				outcome: Outcome::Completed { status: 0x008a },
			}]
		);
		assert!(!engine.has_active_transaction());
		// Back to idle listening.
		assert!(bus.last_op_is_receive());
	}

	#[test]
	fn test_two_clients_fifo_isolation() {
		let (mut engine, bus) = engine();
		engine.pump();

		let frame_a = DaliFrame::new(0xff, 0x08);
		let frame_b = DaliFrame::new(0xff, 0x00);
		engine.submit(frame_a, 1).unwrap();
		assert!(engine.poll_events().is_empty());
		engine.submit(frame_b, 2).unwrap();
		// B waits in the queue while A's send is in flight.
		assert_eq!(bus.sent_messages().len(), 1);
		assert_eq!(engine.queued_requests(), 1);

		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());
		bus.deliver(completion(1, 0x008a));
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(1),
				request: frame_a,
				outcome: Outcome::Completed { status: 0x008a },
			}]
		);

		// B's request goes out with the next sequence number.
		let sent = bus.sent_messages();
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[1][1], 2);
		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());
		bus.deliver(completion(2, 0x008a));
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(2),
				request: frame_b,
				outcome: Outcome::Completed { status: 0x008a },
			}]
		);
	}

	#[test]
	fn test_idle_broadcast() {
		let (mut engine, bus) = engine();
		engine.pump();

		let frame = DaliFrame::new(0xfe, 0x60);
		bus.deliver(broadcast(frame));
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Broadcast {
				frame,
				status: 0xffff
			}]
		);
		// The idle receive is reposted right away.
		assert!(bus.last_op_is_receive());
	}

	#[test]
	fn test_broadcast_while_transaction_active() {
		let (mut engine, bus) = engine();
		engine.pump();
		let frame = DaliFrame::new(0xff, 0x08);
		engine.submit(frame, 1).unwrap();
		assert!(engine.poll_events().is_empty());
		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());

		// Bus chatter lands while we wait for our reply.
		let chatter = DaliFrame::new(0xff, 0x93);
		bus.deliver(broadcast(chatter));
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Broadcast {
				frame: chatter,
				status: 0xffff
			}]
		);
		// The transaction is unaffected and the reply still routes.
		assert!(engine.has_active_transaction());
		bus.deliver(completion(1, 0x008a));
		let events = engine.poll_events();
		assert_eq!(events.len(), 1);
		assert!(!engine.has_active_transaction());
	}

	#[test]
	fn test_send_timeout_recovers() {
		let (mut engine, bus) = engine();
		engine.pump();
		let frame_a = DaliFrame::new(0xff, 0x08);
		let frame_b = DaliFrame::new(0xff, 0x00);
		engine.submit(frame_a, 1).unwrap();
		engine.submit(frame_b, 2).unwrap();
		assert!(engine.poll_events().is_empty());

		bus.complete_send(TransferStatus::TimedOut);
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(1),
				request: frame_a,
				outcome: Outcome::SendTimeout,
			}]
		);
		// The next queued request is picked up immediately.
		let sent = bus.sent_messages();
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[1][1], 2);
	}

	#[test]
	fn test_receive_timeout_ends_transaction() {
		let (mut engine, bus) = engine();
		engine.pump();
		let frame = DaliFrame::new(0xff, 0x08);
		engine.submit(frame, 1).unwrap();
		assert!(engine.poll_events().is_empty());
		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());

		bus.complete_receive(TransferStatus::TimedOut, None);
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(1),
				request: frame,
				outcome: Outcome::ReceiveTimeout,
			}]
		);
		assert!(!engine.has_active_transaction());
		assert!(bus.last_op_is_receive());
	}

	#[test]
	fn test_idle_receive_timeout_is_reposted() {
		let (mut engine, bus) = engine();
		engine.pump();
		bus.complete_receive(TransferStatus::TimedOut, None);
		assert!(engine.poll_events().is_empty());
		assert!(bus.last_op_is_receive());
	}

	#[test]
	fn test_receive_error_with_active_transaction() {
		let (mut engine, bus) = engine();
		engine.pump();
		let frame = DaliFrame::new(0xff, 0x08);
		engine.submit(frame, 1).unwrap();
		assert!(engine.poll_events().is_empty());
		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());

		bus.complete_receive(TransferStatus::Stall, None);
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(1),
				request: frame,
				outcome: Outcome::ReceiveError,
			}]
		);
	}

	#[test]
	fn test_idle_receive_error_reports_broadcast_error() {
		let (mut engine, bus) = engine();
		engine.pump();
		bus.complete_receive(TransferStatus::Error, None);
		let events = engine.poll_events();
		assert_eq!(events, vec![Event::BroadcastError]);
	}

	#[test]
	fn test_cancelled_origin_gets_no_delivery() {
		let (mut engine, bus) = engine();
		engine.pump();
		let frame = DaliFrame::new(0xff, 0x08);
		engine.submit(frame, 9).unwrap();
		assert!(engine.poll_events().is_empty());
		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());

		// The client goes away before the adapter answers.
		engine.cancel_origin(9);
		bus.deliver(completion(1, 0x008a));
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: None,
				request: frame,
				outcome: Outcome::Completed { status: 0x008a },
			}]
		);
		assert!(!engine.has_active_transaction());
	}

	#[test]
	fn test_cancel_origin_drops_queued_requests() {
		let (mut engine, bus) = engine();
		engine.pump();
		engine.submit(DaliFrame::new(0xff, 0x08), 1).unwrap();
		// Let the idle-receive cancel through so request 1 hits the wire.
		let _ = engine.poll_events();
		engine.submit(DaliFrame::new(0xff, 0x00), 2).unwrap();
		engine.submit(DaliFrame::new(0xfe, 0x60), 2).unwrap();
		assert_eq!(engine.queued_requests(), 2);

		engine.cancel_origin(2);
		assert_eq!(engine.queued_requests(), 0);

		// Client 1's transaction is untouched.
		let _ = engine.poll_events();
		bus.complete_send(TransferStatus::Completed);
		let _ = engine.poll_events();
		bus.deliver(completion(1, 0x008a));
		let events = engine.poll_events();
		assert_eq!(events.len(), 1);
		assert!(matches!(
			events[0],
			Event::Request {
				origin: Some(1),
				..
			}
		));
	}

	#[test]
	fn test_queue_full() {
		let bus = StubBus::default();
		let mut engine: Engine<StubBus, u32> = Engine::with_queue_limit(bus.clone(), 2).unwrap();
		engine.pump();

		// The first request leaves the queue for the wire immediately
		// (after the idle receive cancel); two more fill the queue.
		engine.submit(DaliFrame::new(0xff, 0x08), 1).unwrap();
		let _ = engine.poll_events();
		engine.submit(DaliFrame::new(0xff, 0x00), 2).unwrap();
		engine.submit(DaliFrame::new(0xfe, 0x60), 3).unwrap();
		assert_eq!(engine.queued_requests(), 2);

		let err = engine.submit(DaliFrame::new(0xff, 0x90), 4).unwrap_err();
		assert!(matches!(err, Error::QueueFull));
		assert_eq!(engine.queued_requests(), 2);
	}

	#[test]
	fn test_zero_queue_limit_is_rejected() {
		let bus = StubBus::default();
		assert!(matches!(
			Engine::<StubBus, u32>::with_queue_limit(bus, 0),
			Err(Error::InvalidArg(_))
		));
	}

	#[test]
	fn test_sequence_numbers_skip_zero() {
		let (mut engine, bus) = engine();
		engine.pump();

		let frame = DaliFrame::new(0xff, 0x08);
		for i in 0..300u32 {
			engine.submit(frame, i).unwrap();
			let events = run_transaction(&mut engine, &bus, 0x008a);
			assert_eq!(events.len(), 1, "request {} got {} outcomes", i, events.len());
		}

		let seqs: Vec<u8> = bus.sent_messages().iter().map(|m| m[1]).collect();
		assert_eq!(seqs.len(), 300);
		assert!(!seqs.contains(&0));
		// 1..=255, then wrapping back to 1.
		let expected: Vec<u8> = (1..=255u8).chain(1..=45u8).collect();
		assert_eq!(seqs, expected);
	}

	#[test]
	fn test_mismatched_seqnum_is_ignored() {
		let (mut engine, bus) = engine();
		engine.pump();
		let frame = DaliFrame::new(0xff, 0x08);
		engine.submit(frame, 1).unwrap();
		assert!(engine.poll_events().is_empty());
		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());

		bus.deliver(completion(0x63, 0x008a));
		assert!(engine.poll_events().is_empty());
		assert!(engine.has_active_transaction());

		bus.deliver(completion(1, 0x008a));
		assert_eq!(engine.poll_events().len(), 1);
		assert!(!engine.has_active_transaction());
	}

	#[test]
	fn test_unknown_message_types_are_skipped() {
		let (mut engine, bus) = engine();
		engine.pump();
		bus.deliver(DeviceMessage {
			direction: Direction::Dali,
			kind: Kind::Unknown(0x77),
			frame: DaliFrame::new(0x00, 0x03),
			status: 0x0053,
			seqnum: 0,
		});
		assert!(engine.poll_events().is_empty());
		assert!(bus.last_op_is_receive());
	}

	#[test]
	fn test_refused_send_reports_send_error() {
		let (mut engine, bus) = engine();
		engine.pump();
		let _ = engine.poll_events();
		bus.refuse_sends(true);

		let frame = DaliFrame::new(0xff, 0x08);
		engine.submit(frame, 5).unwrap();
		let events = engine.poll_events();
		assert_eq!(
			events,
			vec![Event::Request {
				origin: Some(5),
				request: frame,
				outcome: Outcome::SendError,
			}]
		);
		assert!(!engine.has_active_transaction());
	}

	#[test]
	fn test_response_then_completion_yields_two_events() {
		// Either order of answer frame and completion must leave the
		// engine consistent; the reply payload arrives first here.
		let (mut engine, bus) = engine();
		engine.pump();
		let frame = DaliFrame::new(0xff, 0x90);
		engine.submit(frame, 3).unwrap();
		assert!(engine.poll_events().is_empty());
		bus.complete_send(TransferStatus::Completed);
		assert!(engine.poll_events().is_empty());

		let answer = DaliFrame::new(0xff, 0x42);
		bus.deliver(response(1, answer, 0x0042));
		let events = engine.poll_events();
		assert_eq!(events.len(), 1);
		assert!(matches!(
			events[0],
			Event::Request {
				outcome: Outcome::Response { .. },
				..
			}
		));
		assert!(engine.has_active_transaction());

		bus.deliver(completion(1, 0x0000));
		let events = engine.poll_events();
		assert_eq!(events.len(), 1);
		assert!(matches!(
			events[0],
			Event::Request {
				outcome: Outcome::Completed { .. },
				..
			}
		));
		assert!(!engine.has_active_transaction());
	}
}
