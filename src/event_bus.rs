/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread: receives [events](crate::events) published by the engine's components
//! and calls the handlers the host registered for each event kind.
//!
//! Handlers are plain boxed closures. The default handlers, installed by
//! [`EventHandlers::with_default_loggers`], print each event in the CSV format described in
//! [logging](crate::logging). Custom handlers can be appended for metrics, persistence hooks,
//! or test assertions.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging;

/// A pointer to an event handler closure.
pub type HandlerPtr<E> = Box<dyn Fn(&E) + Send>;

/// The registered handlers for every event kind.
#[derive(Default)]
pub struct EventHandlers {
    pub insert_block_handlers: Vec<HandlerPtr<InsertBlockEvent>>,
    pub propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub receive_msg_handlers: Vec<HandlerPtr<ReceiveMsgEvent>>,
    pub broadcast_msg_handlers: Vec<HandlerPtr<BroadcastMsgEvent>>,
    pub impeach_handlers: Vec<HandlerPtr<ImpeachEvent>>,
    pub sync_request_handlers: Vec<HandlerPtr<SyncRequestEvent>>,
    pub update_committees_handlers: Vec<HandlerPtr<UpdateCommitteesEvent>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers that log every event out through the `log` crate.
    pub fn with_default_loggers() -> Self {
        let mut handlers = Self::new();
        handlers.insert_block_handlers.push(Box::new(logging::log_insert_block));
        handlers.propose_handlers.push(Box::new(logging::log_propose));
        handlers.receive_msg_handlers.push(Box::new(logging::log_receive_msg));
        handlers.broadcast_msg_handlers.push(Box::new(logging::log_broadcast_msg));
        handlers.impeach_handlers.push(Box::new(logging::log_impeach));
        handlers.sync_request_handlers.push(Box::new(logging::log_sync_request));
        handlers.update_committees_handlers.push(Box::new(logging::log_update_committees));
        handlers
    }

    fn fire(&self, event: &Event) {
        match event {
            Event::InsertBlock(e) => self.insert_block_handlers.iter().for_each(|h| h(e)),
            Event::Propose(e) => self.propose_handlers.iter().for_each(|h| h(e)),
            Event::ReceiveMsg(e) => self.receive_msg_handlers.iter().for_each(|h| h(e)),
            Event::BroadcastMsg(e) => self.broadcast_msg_handlers.iter().for_each(|h| h(e)),
            Event::Impeach(e) => self.impeach_handlers.iter().for_each(|h| h(e)),
            Event::SyncRequest(e) => self.sync_request_handlers.iter().for_each(|h| h(e)),
            Event::UpdateCommittees(e) => self.update_committees_handlers.iter().for_each(|h| h(e)),
        }
    }
}

/// Spawn the event bus thread. It drains the subscriber channel and fires the registered
/// handlers until the shutdown signal arrives.
pub fn start_event_bus(
    handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }
        match event_subscriber.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => handlers.fire(&event),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// An owned, running event bus: the channel to publish into plus the shutdown handle.
pub struct EventBus {
    publisher: Sender<Event>,
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl EventBus {
    /// Start a bus over the given handlers.
    pub fn start(handlers: EventHandlers) -> Self {
        let (publisher, subscriber) = std::sync::mpsc::channel();
        let (shutdown, shutdown_receiver) = std::sync::mpsc::channel();
        let thread = start_event_bus(handlers, subscriber, shutdown_receiver);
        Self { publisher, shutdown, thread: Some(thread) }
    }

    /// The channel components publish events into.
    pub fn publisher(&self) -> Sender<Event> {
        self.publisher.clone()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockNumber, CryptoHash};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::SystemTime;

    #[test]
    fn registered_handlers_see_published_events() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut handlers = EventHandlers::new();
        let counter = Arc::clone(&seen);
        handlers.insert_block_handlers.push(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let bus = EventBus::start(handlers);
        let publisher = Some(bus.publisher());
        for number in 1..=3u64 {
            Event::InsertBlock(InsertBlockEvent {
                timestamp: SystemTime::now(),
                number: BlockNumber::new(number),
                hash: CryptoHash::zero(),
                impeached: false,
            })
            .publish(&publisher);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
