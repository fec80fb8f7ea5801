/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local node.
//!
//! Each variant of the [event enum](Event) wraps an inner struct summarizing the occurrence,
//! always including the time it happened. Events are emitted **after** the corresponding
//! occurrence completed; the insert-block event, for example, fires only once the chain writer
//! accepted the block.
//!
//! The host registers a plain `mpsc` channel to receive events; passing `None` disables
//! publication entirely.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::lbft::messages::MsgCode;
use crate::types::{Address, BlockNumber, CryptoHash, Term};

/// Enumerates all events the engine emits.
pub enum Event {
    /// A finalized block was inserted into the local chain.
    InsertBlock(InsertBlockEvent),
    /// This node broadcast its own proposal to the validators.
    Propose(ProposeEvent),
    /// A consensus message was received from a peer.
    ReceiveMsg(ReceiveMsgEvent),
    /// A consensus message was broadcast to the committee.
    BroadcastMsg(BroadcastMsgEvent),
    /// The impeachment track was armed for a height.
    Impeach(ImpeachEvent),
    /// A peer was ahead of us; a sync was requested against it.
    SyncRequest(SyncRequestEvent),
    /// The overlay reconciled its peer tables with a new term's committees.
    UpdateCommittees(UpdateCommitteesEvent),
}

impl Event {
    /// Publishes the event on the channel, if one is registered.
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

pub struct InsertBlockEvent {
    pub timestamp: SystemTime,
    pub number: BlockNumber,
    pub hash: CryptoHash,
    pub impeached: bool,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub number: BlockNumber,
    pub hash: CryptoHash,
}

pub struct ReceiveMsgEvent {
    pub timestamp: SystemTime,
    pub origin: Option<Address>,
    pub code: MsgCode,
    pub number: BlockNumber,
    pub hash: CryptoHash,
}

pub struct BroadcastMsgEvent {
    pub timestamp: SystemTime,
    pub code: MsgCode,
    pub number: BlockNumber,
    pub hash: CryptoHash,
    pub peers: usize,
}

pub struct ImpeachEvent {
    pub timestamp: SystemTime,
    pub number: BlockNumber,
}

pub struct SyncRequestEvent {
    pub timestamp: SystemTime,
    pub peer: Address,
    pub their_number: BlockNumber,
    pub our_number: BlockNumber,
}

pub struct UpdateCommitteesEvent {
    pub timestamp: SystemTime,
    pub term: Term,
    pub proposers: usize,
    pub validators: usize,
}
