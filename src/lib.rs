/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A proof-of-reputation (DPoR) BFT consensus engine.
//!
//! At each block height, a proposer drawn from an elected committee constructs a candidate
//! block, the validator committee runs a three-phase commit over the block's header, and the
//! resulting block — carrying enough signatures to prove super-majority agreement — is inserted
//! into the local chain. If the proposer stays silent, an impeachment track replaces its block
//! with an empty one, keeping the chain live.
//!
//! The crate is the consensus core only. Block execution, persistence backends, contract
//! internals and the low-level peer transport are external collaborators reached through the
//! traits in [`chain`] and [`dialer`].

pub mod chain;

pub mod config;

pub mod dialer;

pub mod election;

pub mod engine;

pub mod errors;

pub mod event_bus;

pub mod events;

pub mod handler;

pub mod lbft;

pub mod snapshot;

pub mod stream;

pub mod types;

pub(crate) mod logging;

// Re-exports
pub use config::{Configuration, DporConfig};
pub use engine::{Dpor, DporBackend, EngineMode};
pub use handler::Handler;
pub use snapshot::DporSnapshot;
