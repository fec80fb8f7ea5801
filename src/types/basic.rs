/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected, but have no active behavior. These types
//! follow the newtype pattern, and the API for using them is defined in this module.
//!
//! Identifiers are Ethereum-style: a 20-byte [`Address`] recovered from an ECDSA signature, and a
//! 32-byte Keccak-256 [`CryptoHash`].

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, Sub},
};

/// Number of bytes in an [`Address`].
pub const ADDRESS_LENGTH: usize = 20;

/// Number of bytes in a 65-byte recoverable ECDSA signature (r ‖ s ‖ v).
pub const SIGNATURE_LENGTH: usize = 65;

/// A 20-byte account identifier: the low 20 bytes of the Keccak-256 digest of an uncompressed
/// secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; ADDRESS_LENGTH])
    }

    pub const fn bytes(&self) -> [u8; ADDRESS_LENGTH] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LENGTH]
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ADDRESS_LENGTH {
            return None;
        }
        let mut buf = [0u8; ADDRESS_LENGTH];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A 32-byte Keccak-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The low-order 64 bits of the digest interpreted as a big-endian integer. Used as the
    /// election seed at checkpoints.
    pub fn low_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[24..32]);
        u64::from_be_bytes(buf)
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Height of a block in the chain.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct BlockNumber(u64);

impl BlockNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn is_genesis(&self) -> bool {
        self.0 == 0
    }
}

impl Display for BlockNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockNumber {
    type Output = BlockNumber;
    fn add(self, rhs: u64) -> Self::Output {
        BlockNumber(self.0 + rhs)
    }
}

impl Sub<u64> for BlockNumber {
    type Output = BlockNumber;
    fn sub(self, rhs: u64) -> Self::Output {
        BlockNumber(self.0 - rhs)
    }
}

/// Index of a term: a contiguous range of `epoch_length` block numbers over which the proposer
/// rotation is fixed.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct Term(u64);

impl Term {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A reputation score assigned to a candidate by the reputation registry. Non-negative.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct Reputation(u64);

impl Reputation {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Block difficulty. Only three values are meaningful to the engine.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct Difficulty(u64);

/// Difficulty of a block sealed by the in-turn proposer.
pub const DIFF_IN_TURN: Difficulty = Difficulty(2);

/// Difficulty of a block sealed by an out-of-turn proposer.
pub const DIFF_NO_TURN: Difficulty = Difficulty(1);

/// Difficulty of a leaderless impeachment block.
pub const DIFF_IMPEACH: Difficulty = Difficulty(0);

impl Difficulty {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// A 65-byte recoverable ECDSA signature in bytes (r ‖ s ‖ v).
#[derive(Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignatureBytes([u8; SIGNATURE_LENGTH]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub const fn vacant() -> Self {
        Self([0u8; SIGNATURE_LENGTH])
    }

    pub const fn bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0
    }

    /// A vacant slot is all zeros; it carries no signature.
    pub fn is_vacant(&self) -> bool {
        self.0 == [0u8; SIGNATURE_LENGTH]
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SIGNATURE_LENGTH {
            return None;
        }
        let mut buf = [0u8; SIGNATURE_LENGTH];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "sig(0x{}…)", hex::encode(&self.0[..4]))
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self::vacant()
    }
}

/// The per-validator signature vector of a header: exactly `epoch_length` slots, where slot `i`
/// is either all-zero (vacant) or the 65-byte signature of the committee member with rotation
/// index `i`.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct SignatureSet(Vec<SignatureBytes>);

impl SignatureSet {
    pub fn new(len: usize) -> Self {
        Self(vec![SignatureBytes::vacant(); len])
    }

    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&SignatureBytes> {
        self.0.get(pos)
    }

    pub fn set(&mut self, pos: usize, sig: SignatureBytes) {
        self.0[pos] = sig;
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SignatureBytes> {
        self.0.iter()
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|s| !s.is_vacant()).count()
    }

    /// Copy every occupied slot of `other` into this set. An occupied local slot whose bytes
    /// differ from the incoming ones is a conflict: the merge stops and reports the slot index.
    pub fn merge(&mut self, other: &SignatureSet) -> Result<(), usize> {
        for (pos, sig) in other.iter().enumerate() {
            if sig.is_vacant() || pos >= self.0.len() {
                continue;
            }
            let local = self.0[pos];
            if local.is_vacant() {
                self.0[pos] = *sig;
            } else if local != *sig {
                return Err(pos);
            }
        }
        Ok(())
    }
}
