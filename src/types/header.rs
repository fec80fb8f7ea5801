/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the block header and block types, and the codec for the consensus fields
//! embedded in the header's `extra` field.
//!
//! ## `extra` layout
//!
//! ```text
//! [vanity: 32 bytes] [proposers: 20 × epoch_length bytes] [leader_seal: 65 bytes]
//! ```
//!
//! The leader's signature always sits in the trailing 65 bytes. The per-validator signature
//! vector lives in a separate field ([`Header::sigs`]) so that the digest the committee signs
//! ([`sig_hash`](crate::types::crypto::sig_hash)) can exclude it entirely: the vector depends on
//! the digest, the digest never depends on the vector.

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::*;

/// Number of vanity bytes at the front of `extra`.
pub const EXTRA_VANITY: usize = 32;

/// Number of bytes reserved at the tail of `extra` for the leader's seal.
pub const EXTRA_SEAL: usize = SIGNATURE_LENGTH;

/// A block header. Carries the consensus fields the DPoR engine verifies; body execution fields
/// (state root and friends) are opaque digests supplied by the collaborator that executes blocks.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub parent_hash: CryptoHash,
    pub coinbase: Address,
    pub state_root: CryptoHash,
    pub txs_root: CryptoHash,
    pub receipts_root: CryptoHash,
    pub number: BlockNumber,
    pub time: u64,
    pub difficulty: Difficulty,
    /// Vanity bytes, the encoded proposer committee, and the leader seal. See the module doc.
    pub extra: Vec<u8>,
    pub mix_hash: CryptoHash,
    /// The per-validator signature vector. Excluded from both hashes of this header.
    pub sigs: SignatureSet,
}

impl Header {
    /// The identity of this header: the Keccak-256 digest of every field except the signature
    /// vector. Stable while prepare/commit signatures accumulate, which is what makes it usable
    /// as a routing key for consensus messages.
    pub fn hash(&self) -> CryptoHash {
        crate::types::crypto::header_hash(self)
    }

    /// The bytes of `extra` between the vanity prefix and the seal suffix: the proposer
    /// committee, 20 bytes per slot.
    pub fn proposer_bytes(&self) -> Option<&[u8]> {
        if self.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return None;
        }
        Some(&self.extra[EXTRA_VANITY..self.extra.len() - EXTRA_SEAL])
    }

    /// Decode the proposer committee out of `extra`.
    pub fn proposers(&self) -> Option<Vec<Address>> {
        let bytes = self.proposer_bytes()?;
        if bytes.len() % ADDRESS_LENGTH != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(ADDRESS_LENGTH)
                .map(|chunk| Address::from_slice(chunk).unwrap())
                .collect(),
        )
    }

    /// The leader's seal: the trailing 65 bytes of `extra`.
    pub fn leader_seal(&self) -> Option<SignatureBytes> {
        if self.extra.len() < EXTRA_SEAL {
            return None;
        }
        SignatureBytes::from_slice(&self.extra[self.extra.len() - EXTRA_SEAL..])
    }

    /// Overwrite the trailing seal slot of `extra`. `extra` must already carry the full layout.
    pub fn set_leader_seal(&mut self, seal: SignatureBytes) {
        let at = self.extra.len() - EXTRA_SEAL;
        self.extra[at..].copy_from_slice(&seal.bytes());
    }

    /// Assemble `extra` from its three sections. Vanity longer than [`EXTRA_VANITY`] is
    /// truncated, shorter is zero-padded.
    pub fn encode_extra(vanity: &[u8], proposers: &[Address], seal: SignatureBytes) -> Vec<u8> {
        let mut extra = Vec::with_capacity(EXTRA_VANITY + proposers.len() * ADDRESS_LENGTH + EXTRA_SEAL);
        let mut vanity_section = [0u8; EXTRA_VANITY];
        let take = vanity.len().min(EXTRA_VANITY);
        vanity_section[..take].copy_from_slice(&vanity[..take]);
        extra.extend_from_slice(&vanity_section);
        for proposer in proposers {
            extra.extend_from_slice(&proposer.bytes());
        }
        extra.extend_from_slice(&seal.bytes());
        extra
    }
}

/// A transaction is opaque to the consensus core.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Transaction(Vec<u8>);

impl Transaction {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A block: a header plus its (opaque) transactions.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions }
    }

    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// An impeachment block replaces a silent proposer's block: zero coinbase, no transactions,
    /// impeach difficulty.
    pub fn is_impeach(&self) -> bool {
        self.header.coinbase.is_zero()
            && self.transactions.is_empty()
            && self.header.difficulty == DIFF_IMPEACH
    }
}
