/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The engine's error taxonomy.
//!
//! Propagation policy:
//! - Structural and authority errors are fatal for the offending message: it is dropped, never
//!   retried, and logged.
//! - Temporal errors are recoverable: [`VerifyError::FutureBlock`] suspends verification until
//!   the wall clock catches up, [`VerifyError::UnknownAncestor`] triggers a sync request against
//!   the delivering peer.
//! - Quorum errors are transient: the header is held until enough signatures accumulate.
//! - Protocol errors at handshake terminate the peer connection.

use thiserror::Error;

use crate::types::{BlockNumber, CryptoHash};

/// Errors from the cryptographic primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("signature recovery failed")]
    BadSignature,
    #[error("invalid secret key bytes")]
    BadSecretKey,
    #[error("signing failed")]
    SigningFailed,
}

/// Errors from header verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("extra-data shorter than the vanity prefix")]
    MissingVanity,
    #[error("extra-data shorter than vanity plus seal")]
    MissingSignature,
    #[error("signer section of extra-data is malformed")]
    InvalidSigners,
    #[error("block difficulty does not match the leader's turn")]
    InvalidDifficulty,
    #[error("non-zero mix digest")]
    InvalidMixHash,
    #[error("block timestamp is below parent time plus period")]
    InvalidTimestamp,
    #[error("invalid block number")]
    InvalidNumber,
    #[error("block in the future")]
    FutureBlock,
    #[error("unknown ancestor")]
    UnknownAncestor,
    #[error("pruned ancestor")]
    PrunedAncestor,
    #[error("unauthorized leader")]
    Unauthorized,
    #[error("not enough sigs: block hash: {0}")]
    NotEnoughSigs(CryptoHash),
    #[error("no signatures cached for header")]
    NoSigsInCache,
    #[error("fake engine failure at configured height")]
    FakeFail,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl VerifyError {
    /// Recoverable errors may be retried later; fatal ones mean the header is bad.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VerifyError::FutureBlock
                | VerifyError::UnknownAncestor
                | VerifyError::PrunedAncestor
                | VerifyError::NotEnoughSigs(_)
                | VerifyError::NoSigsInCache
        )
    }
}

/// Errors from snapshot derivation and lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("headers are not contiguous with the snapshot")]
    NonContiguousHeaders,
    #[error("unknown ancestor")]
    UnknownAncestor,
    #[error("{have} candidates cannot fill a committee of {need}")]
    InsufficientCandidates { have: usize, need: usize },
    #[error("genesis block has no leader")]
    GenesisBlockNumber,
    #[error("signer not in committee")]
    SignerNotInCommittee,
    #[error("genesis extra-data is malformed")]
    BadGenesisExtra,
    #[error("no snapshot stored under hash {0}")]
    NotFound(CryptoHash),
    #[error("stored snapshot bytes are corrupt")]
    Corrupt,
    #[error("registry unavailable: {0}")]
    Registry(String),
}

/// Errors from signing a header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignError {
    #[error("local identity is not in the committee for block {0}")]
    NotInCommittee(BlockNumber),
    #[error("already signed a different block at height {number}")]
    DoubleSignAttempt { number: BlockNumber, signed: CryptoHash },
    #[error("no keypair configured")]
    NoKeypair,
    #[error("sealing aborted by stop signal")]
    Aborted,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors from the peer protocol: handshakes and message framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("unknown message code {0}")]
    UnknownMessageCode(u64),
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("peer is not a committee member")]
    NotInCommittee,
    #[error("expected a status message first")]
    NoStatusMsg,
    #[error("peer connection closed")]
    Disconnected,
    #[error("failed to decode message payload")]
    Decode,
}

/// Errors from the per-height BFT state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    #[error("message is for height {got}, this machine runs height {expected}")]
    WrongHeight { expected: BlockNumber, got: BlockNumber },
    #[error("message hash does not match the block under consensus")]
    HashMismatch,
    #[error("conflicting signature in slot {0}; message discarded")]
    ConflictingSignature(usize),
    #[error("unexpected message {code:?} in state {state:?}")]
    UnexpectedMsg { code: crate::lbft::messages::MsgCode, state: crate::lbft::fsm::LbftState },
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Sign(#[from] SignError),
}

/// Errors from the chain writer collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("block {0} rejected by the chain")]
    Rejected(CryptoHash),
    #[error("unknown ancestor")]
    UnknownAncestor,
}

/// Errors from the committee overlay dialer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialerError {
    #[error("no RSA public key registered for peer")]
    NoPubkey,
    #[error("RSA encryption failed")]
    Encrypt,
    #[error("registry rejected the node info submission: {0}")]
    Registry(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
