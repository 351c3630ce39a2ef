//! Multiplexer: client frames go into the engine, engine events come back
//! out as client replies and broadcasts.

use log::{info, warn};

use dali_core::wire::{self, Reply};
use dali_core::{Event, Outcome};

use crate::server::{ClientId, Server};
use crate::App;

/// One full frame arrived from a client.  Parse it, mark the connection
/// waiting and push the request at the engine (or fake an answer in
/// dry-run operation).
pub fn handle_frame(app: &mut App, id: ClientId, bytes: [u8; wire::FRAME_LENGTH]) {
	let request = match wire::Request::unpack(&bytes) {
		Ok(request) => request,
		Err(err) => {
			// Not fatal to the connection; the frame is just dropped.
			warn!("ignoring client frame: {}", err);
			return;
		}
	};
	info!("got frame: {:#04x} {:#04x}", request.address, request.command);

	match app.server.connection_mut(id) {
		Some(connection) => {
			if connection.waiting {
				warn!("request while a reply is outstanding, ignoring");
				return;
			}
			connection.waiting = true;
		}
		None => return,
	}

	let submitted = app
		.engine
		.as_mut()
		.map(|engine| engine.submit(request.frame(), id));
	match submitted {
		Some(Ok(())) => drain_engine(app),
		Some(Err(err)) => {
			warn!("can't queue request: {}", err);
			if !app.server.reply(id, &Reply::Error) {
				app.fail_connection(id);
			}
			drain_engine(app);
		}
		None => {
			// Dry-run: answer right away, as if the bus had nothing to say.
			if !app.server.reply(id, &Reply::Response { response: 0 }) {
				app.fail_connection(id);
			}
		}
	}
}

/// Pull pending engine events and deliver them.  Connections whose sockets
/// broke while writing are torn down.
pub fn drain_engine(app: &mut App) {
	let events = match app.engine.as_mut() {
		Some(engine) => engine.poll_events(),
		None => return,
	};
	if events.is_empty() {
		return;
	}
	let broken = deliver(&mut app.server, events);
	for id in broken {
		app.fail_connection(id);
	}
}

/// Map engine events onto the wire and write them out.  Returns the
/// connections that failed mid-write.
pub fn deliver(server: &mut Server, events: Vec<Event<ClientId>>) -> Vec<ClientId> {
	let mut broken = Vec::new();
	for event in events {
		match event {
			Event::Request {
				origin,
				request,
				outcome,
			} => {
				match outcome {
					Outcome::Response { frame, status } => info!(
						"response to ({:#04x} {:#04x}): frame {:#04x} {:#04x}, status {:#06x}",
						request.address, request.command, frame.address, frame.command, status
					),
					Outcome::Completed { status } => info!(
						"request ({:#04x} {:#04x}) completed: status {:#06x}",
						request.address, request.command, status
					),
					other => warn!(
						"request ({:#04x} {:#04x}) failed: {:?}",
						request.address, request.command, other
					),
				}
				let id = match origin {
					Some(id) => id,
					// The originator disconnected mid-transaction.
					None => continue,
				};
				if !server.reply(id, &reply_for(&outcome)) {
					broken.push(id);
				}
			}
			Event::Broadcast { frame, status } => {
				info!(
					"broadcast ({:#04x} {:#04x}): {:#04x}",
					frame.address,
					frame.command,
					status & 0xff
				);
				broken.extend(server.broadcast(&Reply::Broadcast {
					address: frame.address,
					command: frame.command,
				}));
			}
			Event::BroadcastError => {
				warn!("receive error with no transaction active");
			}
		}
	}
	broken
}

fn reply_for(outcome: &Outcome) -> Reply {
	match outcome {
		Outcome::Response { status, .. } => Reply::Success {
			response: (status & 0xff) as u8,
		},
		Outcome::Completed { status } => Reply::Success {
			response: (status & 0xff) as u8,
		},
		Outcome::SendTimeout
		| Outcome::ReceiveTimeout
		| Outcome::SendError
		| Outcome::ReceiveError => Reply::Error,
	}
}
