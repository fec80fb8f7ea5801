/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The snapshot subsystem: the authoritative mapping from a block number to the committees that
//! govern it.
//!
//! A [`DporSnapshot`] captures the consensus state as of one `(number, hash)`: the proposer
//! rotation and validator committee of the current term, the candidate set, the leaders recently
//! seen per term, and the committees elected for the *next* term (so that peers can pre-connect).
//!
//! A snapshot is created once from the genesis extra-data and from then on derived by
//! [applying](DporSnapshot::apply) headers in ascending order. Derivation is deterministic:
//! applying `h1..hn` in one call equals applying `h1..hk` and then `hk+1..hn`. Snapshots are
//! persisted to the store at every checkpoint and the serialization is canonical, so two
//! snapshots with the same `(number, hash)` are byte-identical.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::chain::{CandidateRegistry, KVGet, KVStore};
use crate::config::DporConfig;
use crate::election::elect;
use crate::errors::SnapshotError;
use crate::types::crypto::{recover, sig_hash};
use crate::types::{Address, BlockNumber, CryptoHash, Header, Term, ADDRESS_LENGTH};
use crate::types::{EXTRA_SEAL, EXTRA_VANITY};

/// Prefix of the store key a snapshot is persisted under.
const STORE_PREFIX: &[u8] = b"dpor-";

/// The consensus state as of a particular block.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct DporSnapshot {
    /// Committee size and term length; embedded so a loaded snapshot is self-describing.
    epoch_length: u64,
    checkpoint_interval: u64,

    /// Block number where the snapshot was created.
    number: BlockNumber,
    /// Block hash where the snapshot was created.
    hash: CryptoHash,

    /// The proposer rotation for the current term, one slot per view index.
    proposers: Vec<Address>,
    /// The validator committee authorized to sign headers this term.
    validators: Vec<Address>,
    /// The candidate registry contents as of this block.
    candidates: Vec<Address>,
    /// Leaders seen per term, for replay protection within an epoch.
    recent_signers: BTreeMap<Term, BTreeSet<Address>>,
    /// The proposer rotation elected for the next term.
    future_proposers: Vec<Address>,
    /// The validator committee of the next term.
    future_validators: Vec<Address>,
}

impl DporSnapshot {
    /// Create a snapshot with the given bootstrap committee. Only ever use this for the genesis
    /// block: it does not initialize `recent_signers`.
    pub fn new(
        config: &DporConfig,
        number: BlockNumber,
        hash: CryptoHash,
        proposers: Vec<Address>,
    ) -> Self {
        Self {
            epoch_length: config.epoch_length,
            checkpoint_interval: config.checkpoint_interval,
            number,
            hash,
            validators: proposers.clone(),
            future_proposers: proposers.clone(),
            future_validators: proposers.clone(),
            proposers,
            candidates: Vec::new(),
            recent_signers: BTreeMap::new(),
        }
    }

    /// Parse the genesis extra-data: the bytes between the vanity prefix and the seal suffix are
    /// a concatenation of 20-byte addresses which become the bootstrap proposers (and, at
    /// genesis, the validators).
    pub fn genesis(config: &DporConfig, hash: CryptoHash, extra: &[u8]) -> Result<Self, SnapshotError> {
        if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(SnapshotError::BadGenesisExtra);
        }
        let committee_bytes = &extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL];
        if committee_bytes.is_empty() || committee_bytes.len() % ADDRESS_LENGTH != 0 {
            return Err(SnapshotError::BadGenesisExtra);
        }
        let proposers = committee_bytes
            .chunks_exact(ADDRESS_LENGTH)
            .map(|chunk| Address::from_slice(chunk).unwrap())
            .collect();
        Ok(Self::new(config, BlockNumber::new(0), hash, proposers))
    }

    pub fn number(&self) -> BlockNumber {
        self.number
    }

    pub fn hash(&self) -> CryptoHash {
        self.hash
    }

    pub fn epoch_length(&self) -> u64 {
        self.epoch_length
    }

    pub fn proposers(&self) -> &[Address] {
        &self.proposers
    }

    pub fn validators(&self) -> &[Address] {
        &self.validators
    }

    pub fn candidates(&self) -> &[Address] {
        &self.candidates
    }

    pub fn future_proposers(&self) -> &[Address] {
        &self.future_proposers
    }

    pub fn future_validators(&self) -> &[Address] {
        &self.future_validators
    }

    pub fn recent_signers_of(&self, term: Term) -> Option<&BTreeSet<Address>> {
        self.recent_signers.get(&term)
    }

    pub fn term_of(&self, number: BlockNumber) -> Term {
        if number.is_genesis() {
            Term::new(0)
        } else {
            Term::new((number.int() - 1) / self.epoch_length)
        }
    }

    pub fn is_checkpoint(&self, number: BlockNumber) -> bool {
        number.int() % self.checkpoint_interval == 0
    }

    /// The rotation slot a committee member occupies in the proposer rotation.
    pub fn signer_round(&self, signer: &Address) -> Result<usize, SnapshotError> {
        self.proposers
            .iter()
            .position(|p| p == signer)
            .ok_or(SnapshotError::SignerNotInCommittee)
    }

    pub fn is_validator(&self, address: &Address) -> bool {
        self.validators.contains(address)
    }

    pub fn is_proposer(&self, address: &Address) -> bool {
        self.proposers.contains(address)
    }

    pub fn is_future_proposer(&self, address: &Address) -> bool {
        self.future_proposers.contains(address)
    }

    pub fn is_future_validator(&self, address: &Address) -> bool {
        self.future_validators.contains(address)
    }

    /// The proposer expected to lead block `number`.
    pub fn leader_of(&self, number: BlockNumber) -> Result<Address, SnapshotError> {
        if number.is_genesis() {
            return Err(SnapshotError::GenesisBlockNumber);
        }
        let view = ((number.int() - 1) % self.epoch_length) as usize;
        Ok(self.proposers[view])
    }

    /// Whether `signer` is the in-turn leader of block `number`. Exactly one committee member
    /// satisfies this per height.
    pub fn is_leader(&self, signer: &Address, number: BlockNumber) -> Result<bool, SnapshotError> {
        Ok(self.leader_of(number)? == *signer)
    }

    /// The super-majority condition: a signature count `n` proves agreement iff `3n > 2E` for a
    /// committee of `E`.
    pub fn quorum_reached(&self, sig_count: usize) -> bool {
        3 * sig_count as u64 > 2 * self.epoch_length
    }

    /// Derive a new snapshot by applying `headers` on top of this one. Headers must be
    /// contiguous, each linking to the previous by number and parent hash, and the first must
    /// directly follow this snapshot.
    pub fn apply(
        &self,
        headers: &[Header],
        registry: &dyn CandidateRegistry,
    ) -> Result<Self, SnapshotError> {
        if headers.is_empty() {
            return Ok(self.clone());
        }
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 || pair[1].parent_hash != pair[0].hash() {
                return Err(SnapshotError::NonContiguousHeaders);
            }
        }
        if headers[0].number != self.number + 1 || headers[0].parent_hash != self.hash {
            return Err(SnapshotError::NonContiguousHeaders);
        }

        let mut snap = self.clone();
        for header in headers {
            snap.apply_header(header, registry)?;
        }
        Ok(snap)
    }

    fn apply_header(
        &mut self,
        header: &Header,
        registry: &dyn CandidateRegistry,
    ) -> Result<(), SnapshotError> {
        self.number = header.number;
        self.hash = header.hash();

        let term = self.term_of(header.number);
        self.candidates = registry.candidates_of(term)?;

        // Record the sealing leader for replay protection. Unsealed headers (during local
        // assembly) and leaderless impeach blocks have a vacant seal.
        if let Some(seal) = header.leader_seal() {
            if !seal.is_vacant() {
                if let Ok(leader) = recover(&sig_hash(header), &seal) {
                    self.recent_signers.entry(term).or_default().insert(leader);
                }
            }
        }

        if self.is_checkpoint(header.number) {
            self.rotate_committees(header, term, registry)?;
        }
        Ok(())
    }

    /// At a checkpoint: re-elect the proposer rotation from the candidates' reputations, refresh
    /// the validator committees from the registry, and do the same for the next term so the
    /// overlay can pre-connect. An empty or too-small candidate set keeps the sitting committee.
    fn rotate_committees(
        &mut self,
        header: &Header,
        term: Term,
        registry: &dyn CandidateRegistry,
    ) -> Result<(), SnapshotError> {
        let seed = header.hash().low_u64();
        let view_length = self.epoch_length as usize;

        match elect(&registry.reputations_of(term)?, seed, view_length) {
            Ok(proposers) => self.proposers = proposers,
            Err(SnapshotError::InsufficientCandidates { have, need }) => {
                log::debug!(
                    "InsufficientCandidates, {}, {}, keeping committee of term {}",
                    have,
                    need,
                    term
                );
            }
            Err(other) => return Err(other),
        }
        match elect(&registry.reputations_of(term.next())?, seed, view_length) {
            Ok(proposers) => self.future_proposers = proposers,
            Err(SnapshotError::InsufficientCandidates { .. }) => {
                self.future_proposers = self.proposers.clone();
            }
            Err(other) => return Err(other),
        }

        let validators = registry.validator_set_of(term)?;
        if !validators.is_empty() {
            self.validators = validators;
        }
        let future_validators = registry.validator_set_of(term.next())?;
        if !future_validators.is_empty() {
            self.future_validators = future_validators;
        } else {
            self.future_validators = self.validators.clone();
        }
        Ok(())
    }

    fn store_key(hash: &CryptoHash) -> Vec<u8> {
        let mut key = Vec::with_capacity(STORE_PREFIX.len() + 32);
        key.extend_from_slice(STORE_PREFIX);
        key.extend_from_slice(&hash.bytes());
        key
    }

    /// Persist this snapshot under `"dpor-" ++ hash`.
    pub fn store<K: KVStore>(&self, db: &mut K) -> Result<(), SnapshotError> {
        let blob = self.try_to_vec().map_err(|_| SnapshotError::Corrupt)?;
        db.put(&Self::store_key(&self.hash), &blob);
        Ok(())
    }

    /// Load the snapshot persisted under `hash`.
    pub fn load<K: KVGet>(db: &K, hash: &CryptoHash) -> Result<Self, SnapshotError> {
        let blob = db.get(&Self::store_key(hash)).ok_or(SnapshotError::NotFound(*hash))?;
        Self::try_from_slice(&blob).map_err(|_| SnapshotError::Corrupt)
    }
}
