/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split up into smaller, subsystem specific
//! config structs before being passed to components.

use std::time::Duration;

use crate::types::{BlockNumber, Term};

/// Top-level configuration for one node.
#[derive(Clone)]
pub struct Configuration {
    pub engine: DporConfig,
    pub handler: HandlerConfig,
    pub dialer: DialerConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            engine: DporConfig::default(),
            handler: HandlerConfig::default(),
            dialer: DialerConfig::default(),
        }
    }
}

/// Consensus engine parameters. `epoch_length` is the committee size and the length of one term;
/// a snapshot is persisted whenever `number % checkpoint_interval == 0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DporConfig {
    /// Minimum number of seconds between consecutive blocks.
    pub period: u64,
    /// Number of proposer slots per term; also the length of the signature vector.
    pub epoch_length: u64,
    /// Blocks between persisted snapshots.
    pub checkpoint_interval: u64,
}

impl Default for DporConfig {
    fn default() -> Self {
        Self {
            period: 1,
            epoch_length: 4,
            checkpoint_interval: 4,
        }
    }
}

impl DporConfig {
    /// The term a block number falls in. Block 0 belongs to term 0, as do blocks 1 through
    /// `epoch_length`.
    pub fn term_of(&self, number: BlockNumber) -> Term {
        if number.is_genesis() {
            Term::new(0)
        } else {
            Term::new((number.int() - 1) / self.epoch_length)
        }
    }

    pub fn future_term_of(&self, number: BlockNumber) -> Term {
        self.term_of(number).next()
    }

    pub fn is_checkpoint(&self, number: BlockNumber) -> bool {
        number.int() % self.checkpoint_interval == 0
    }

    /// The rotation index of the proposer expected to lead `number`.
    pub fn view_index_of(&self, number: BlockNumber) -> usize {
        ((number.int() - 1) % self.epoch_length) as usize
    }
}

/// Parameters of the protocol handler.
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// How long the FSM waits for a proposer before arming the impeachment track.
    pub impeach_timeout: Duration,
    /// Capacity of the known-block cache used to suppress rebroadcast storms.
    pub known_blocks_capacity: usize,
    /// Capacity of the broadcast dedup record.
    pub broadcast_record_capacity: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            impeach_timeout: Duration::from_secs(10),
            known_blocks_capacity: 256,
            broadcast_record_capacity: 1000,
        }
    }
}

/// Parameters of the committee overlay dialer.
#[derive(Clone, Debug)]
pub struct DialerConfig {
    /// Version exchanged and checked during the handshake.
    pub protocol_version: u32,
    /// Hard deadline for the two-way handshake.
    pub handshake_timeout: Duration,
    /// Interval of the tick that watches the chain head for term changes.
    pub dial_tick: Duration,
    /// Upper bound on a single wire message.
    pub max_msg_size: usize,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            handshake_timeout: Duration::from_secs(5),
            dial_tick: Duration::from_secs(1),
            max_msg_size: 10 * 1024 * 1024,
        }
    }
}
