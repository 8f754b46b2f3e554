//! The three dispatch disciplines for inbound events: `none` handles each
//! event concurrently, `single` is one global FIFO, `per_room` is a FIFO
//! per room. All flavors share the same push/consume surface.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use futures::future::BoxFuture;
use mxbridge_core::{BridgeEvent, Result, config::EventQueueFlavor, err};
use ruma::OwnedRoomId;
use tokio::runtime::Handle;

pub(super) type Consumer = Arc<dyn Fn(BridgeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

pub(super) struct EventQueue {
	flavor: Flavor,
	consumer: Consumer,
	runtime: Handle,
}

enum Flavor {
	None,
	Single(loole::Sender<BridgeEvent>),
	PerRoom(Mutex<HashMap<OwnedRoomId, loole::Sender<BridgeEvent>>>),
}

impl EventQueue {
	pub fn new(flavor: EventQueueFlavor, runtime: Handle, consumer: Consumer) -> Self {
		let flavor = match flavor {
			| EventQueueFlavor::None => Flavor::None,
			| EventQueueFlavor::Single => {
				let (tx, rx) = loole::unbounded();
				runtime.spawn(consume_loop(rx, consumer.clone()));
				Flavor::Single(tx)
			},
			| EventQueueFlavor::PerRoom => Flavor::PerRoom(Mutex::new(HashMap::new())),
		};

		Self { flavor, consumer, runtime }
	}

	pub fn push(&self, event: BridgeEvent) -> Result {
		match &self.flavor {
			| Flavor::None => {
				self.runtime.spawn((self.consumer)(event));
				Ok(())
			},
			| Flavor::Single(tx) => tx.send(event).map_err(|e| err!("{e}")),
			| Flavor::PerRoom(channels) => {
				let Some(room_id) = event.room_id.clone() else {
					// roomless events cannot be room-ordered; run direct
					self.runtime.spawn((self.consumer)(event));
					return Ok(());
				};

				let tx = {
					let mut channels = channels.lock().expect("queue lock");
					channels
						.entry(room_id)
						.or_insert_with(|| {
							let (tx, rx) = loole::unbounded();
							self.runtime
								.spawn(consume_loop(rx, self.consumer.clone()));
							tx
						})
						.clone()
				};

				tx.send(event).map_err(|e| err!("{e}"))
			},
		}
	}

	pub fn close(&self) {
		match &self.flavor {
			| Flavor::None => {},
			| Flavor::Single(tx) => {
				if !tx.is_closed() {
					tx.close();
				}
			},
			| Flavor::PerRoom(channels) => {
				let channels = channels.lock().expect("queue lock");
				for tx in channels.values() {
					if !tx.is_closed() {
						tx.close();
					}
				}
			},
		}
	}
}

async fn consume_loop(rx: loole::Receiver<BridgeEvent>, consumer: Consumer) {
	while let Ok(event) = rx.recv_async().await {
		consumer(event).await;
	}
}
