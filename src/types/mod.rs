/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and primitives shared across the engine's subsystems.

pub mod basic;

pub mod crypto;

pub mod header;

pub use basic::*;
pub use header::{Block, Header, Transaction, EXTRA_SEAL, EXTRA_VANITY};
