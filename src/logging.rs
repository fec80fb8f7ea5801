/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The engine logs through the [log](https://docs.rs/log/latest/log/) crate; to see the
//! messages, install any logging implementation in the host process.
//!
//! ## Log message format
//!
//! Log messages are CSVs with at least two values. The first two are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined here as constants).
//! 2. The time the event was emitted, as seconds since the Unix epoch.
//!
//! The remaining values depend on the event. For example, a received commit message logs as:
//!
//! ```text
//! ReceiveMsg, 1767225600, Commit, 6, 0x8f3a91c2, 0x1b2e44d0
//! ```
//!
//! where the trailing values are the message code, block number, the first four bytes of the
//! block hash, and the first four bytes of the origin address.

use std::time::SystemTime;

use crate::events::*;

pub const INSERT_BLOCK: &str = "InsertBlock";
pub const PROPOSE: &str = "Propose";
pub const RECEIVE_MSG: &str = "ReceiveMsg";
pub const BROADCAST_MSG: &str = "BroadcastMsg";
pub const IMPEACH: &str = "Impeach";
pub const SYNC_REQUEST: &str = "SyncRequest";
pub const UPDATE_COMMITTEES: &str = "UpdateCommittees";

/// A short, readable rendering of a byte sequence: `0x` plus the first four bytes.
pub(crate) fn short_hex(bytes: &[u8]) -> String {
    let take = bytes.len().min(4);
    format!("0x{}", hex::encode(&bytes[..take]))
}

pub(crate) fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn log_insert_block(e: &InsertBlockEvent) {
    log::info!(
        "{}, {}, {}, {}, {}",
        INSERT_BLOCK,
        secs_since_unix_epoch(e.timestamp),
        e.number,
        short_hex(&e.hash.bytes()),
        e.impeached
    )
}

pub(crate) fn log_propose(e: &ProposeEvent) {
    log::info!(
        "{}, {}, {}, {}",
        PROPOSE,
        secs_since_unix_epoch(e.timestamp),
        e.number,
        short_hex(&e.hash.bytes())
    )
}

pub(crate) fn log_receive_msg(e: &ReceiveMsgEvent) {
    log::debug!(
        "{}, {}, {:?}, {}, {}, {}",
        RECEIVE_MSG,
        secs_since_unix_epoch(e.timestamp),
        e.code,
        e.number,
        short_hex(&e.hash.bytes()),
        e.origin.map(|a| short_hex(&a.bytes())).unwrap_or_else(|| "self".to_string())
    )
}

pub(crate) fn log_broadcast_msg(e: &BroadcastMsgEvent) {
    log::debug!(
        "{}, {}, {:?}, {}, {}, {}",
        BROADCAST_MSG,
        secs_since_unix_epoch(e.timestamp),
        e.code,
        e.number,
        short_hex(&e.hash.bytes()),
        e.peers
    )
}

pub(crate) fn log_impeach(e: &ImpeachEvent) {
    log::info!("{}, {}, {}", IMPEACH, secs_since_unix_epoch(e.timestamp), e.number)
}

pub(crate) fn log_sync_request(e: &SyncRequestEvent) {
    log::debug!(
        "{}, {}, {}, {}, {}",
        SYNC_REQUEST,
        secs_since_unix_epoch(e.timestamp),
        short_hex(&e.peer.bytes()),
        e.their_number,
        e.our_number
    )
}

pub(crate) fn log_update_committees(e: &UpdateCommitteesEvent) {
    log::info!(
        "{}, {}, {}, {}, {}",
        UPDATE_COMMITTEES,
        secs_since_unix_epoch(e.timestamp),
        e.term,
        e.proposers,
        e.validators
    )
}
