/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The header verification pipeline.
//!
//! Verification proceeds in four stages: structural checks on the header alone, cascading
//! checks against the parent, a comparison of the committee bytes in `extra` against the
//! parent snapshot, and finally seal recovery with the leader-turn and quorum rules. The
//! caller may pass a batch of ancestors (ascending order) to avoid database lookups when
//! verifying headers that are not in the chain yet.

use crate::chain::{ChainReader, KVStore};
use crate::errors::{SnapshotError, VerifyError};
use crate::snapshot::DporSnapshot;
use crate::types::crypto::{recover, sig_hash};
use crate::types::{
    Address, BlockNumber, CryptoHash, Header, ADDRESS_LENGTH, DIFF_IMPEACH, DIFF_IN_TURN,
    DIFF_NO_TURN, EXTRA_SEAL, EXTRA_VANITY,
};

use super::{unix_now, Dpor, EngineMode, RecoveredSigs};

/// How much of the seal to verify.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SealCheck {
    /// Structure and ancestry only.
    None,
    /// Recover the leader and enforce the turn/difficulty rule; no quorum required. Used at
    /// preprepare time, before validators have signed.
    Leader,
    /// The full rule: leader turn plus a super-majority of validator signatures.
    LeaderAndQuorum,
    /// Quorum only. Used for leaderless impeachment blocks.
    QuorumOnly,
}

impl<K: KVStore> Dpor<K> {
    /// Check whether a header conforms to the consensus rules. `parents` may carry ancestors
    /// not yet in the chain (ascending order); `seal` selects whether the signatures are
    /// verified too.
    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        seal: bool,
        parents: &[Header],
    ) -> Result<(), VerifyError> {
        let check = if seal { SealCheck::LeaderAndQuorum } else { SealCheck::None };
        self.verify_header_inner(chain, header, parents, check)
    }

    pub(crate) fn verify_header_inner(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parents: &[Header],
        check: SealCheck,
    ) -> Result<(), VerifyError> {
        match self.mode() {
            EngineMode::Fake => return Ok(()),
            EngineMode::FakeDelayer(delay) => {
                std::thread::sleep(delay);
                return Ok(());
            }
            EngineMode::FakeFailer(number) => {
                if header.number == number {
                    return Err(VerifyError::FakeFail);
                }
                return Ok(());
            }
            EngineMode::Normal | EngineMode::DoNothingFake => {}
        }

        self.verify_structural(header)?;
        self.verify_cascading(chain, header, parents, check)
    }

    /// Stage one: invariants of the header in isolation.
    fn verify_structural(&self, header: &Header) -> Result<(), VerifyError> {
        // Don't waste time on blocks from the future.
        if header.time > unix_now() {
            return Err(VerifyError::FutureBlock);
        }

        if header.extra.len() < EXTRA_VANITY {
            return Err(VerifyError::MissingVanity);
        }
        if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(VerifyError::MissingSignature);
        }
        let signers_bytes = header.extra.len() - EXTRA_VANITY - EXTRA_SEAL;
        if signers_bytes % ADDRESS_LENGTH != 0 {
            return Err(VerifyError::InvalidSigners);
        }

        // The signature vector carries one slot per rotation member, or is absent entirely.
        if !header.sigs.is_empty() && header.sigs.len() != self.config().epoch_length as usize {
            return Err(VerifyError::InvalidSigners);
        }

        // No fork protection yet, so the mix digest must stay zero.
        if !header.mix_hash.is_zero() {
            return Err(VerifyError::InvalidMixHash);
        }

        if !header.number.is_genesis() {
            let diff = header.difficulty;
            let impeach_shape = header.coinbase.is_zero() && diff == DIFF_IMPEACH;
            if !impeach_shape && diff != DIFF_IN_TURN && diff != DIFF_NO_TURN {
                return Err(VerifyError::InvalidDifficulty);
            }
        }
        Ok(())
    }

    /// Stage two onward: checks that depend on ancestors and the parent snapshot.
    fn verify_cascading(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parents: &[Header],
        check: SealCheck,
    ) -> Result<(), VerifyError> {
        // The genesis block is the always-valid dead end.
        if header.number.is_genesis() {
            return Ok(());
        }

        let parent = if let Some(parent) = parents.last() {
            parent.clone()
        } else {
            chain
                .header_by_hash(&header.parent_hash)
                .ok_or(VerifyError::UnknownAncestor)?
        };
        if parent.number + 1 != header.number || parent.hash() != header.parent_hash {
            return Err(VerifyError::UnknownAncestor);
        }
        if header.time < parent.time + self.config().period {
            return Err(VerifyError::InvalidTimestamp);
        }

        let snap = self.snapshot(chain, parent.number, header.parent_hash, parents)?;

        // The committee bytes embedded in extra must equal the snapshot's rotation.
        let committee = header.proposers().ok_or(VerifyError::InvalidSigners)?;
        if committee != snap.proposers() {
            return Err(VerifyError::InvalidSigners);
        }

        if self.mode() == EngineMode::DoNothingFake || check == SealCheck::None {
            return Ok(());
        }
        self.verify_seal(header, &snap, check)
    }

    /// Stage four: recover the leader and the validator signatures and enforce the turn and
    /// quorum rules.
    fn verify_seal(
        &self,
        header: &Header,
        snap: &DporSnapshot,
        check: SealCheck,
    ) -> Result<(), VerifyError> {
        if header.number.is_genesis() {
            return Err(VerifyError::InvalidNumber);
        }

        if check != SealCheck::QuorumOnly {
            let seal = header.leader_seal().ok_or(VerifyError::MissingSignature)?;
            if seal.is_vacant() {
                return Err(VerifyError::MissingSignature);
            }
            let leader = recover(&sig_hash(header), &seal)?;
            self.cache_leader(header, leader);

            let in_turn = snap
                .is_leader(&leader, header.number)
                .map_err(VerifyError::Snapshot)?;
            if in_turn && header.difficulty != DIFF_IN_TURN {
                return Err(VerifyError::InvalidDifficulty);
            }
            if !in_turn && header.difficulty != DIFF_NO_TURN {
                return Err(VerifyError::InvalidDifficulty);
            }
            if !in_turn && !snap.is_proposer(&leader) {
                return Err(VerifyError::Unauthorized);
            }
        }

        if matches!(check, SealCheck::LeaderAndQuorum | SealCheck::QuorumOnly) {
            let count = self.count_sigs_against(header, snap)?;
            if !snap.quorum_reached(count) {
                return Err(VerifyError::NotEnoughSigs(header.hash()));
            }
        }
        Ok(())
    }

    /// Recover every occupied slot of the signature vector and count the signers that belong
    /// to the committee. Each recovered signature must resolve to a validator.
    pub(crate) fn count_committee_sigs(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
    ) -> Result<usize, VerifyError> {
        if header.number.is_genesis() {
            return Err(VerifyError::InvalidNumber);
        }
        let snap = self.snapshot(chain, header.number - 1, header.parent_hash, &[])?;
        self.count_sigs_against(header, &snap)
    }

    fn count_sigs_against(&self, header: &Header, snap: &DporSnapshot) -> Result<usize, VerifyError> {
        let digest = sig_hash(header);
        let hash = header.hash();
        let mut count = 0;
        for (slot, sig) in header.sigs.iter().enumerate() {
            if sig.is_vacant() {
                continue;
            }
            let signer = match self.cached_signer(&hash, slot) {
                Some(signer) => signer,
                None => {
                    let signer = recover(&digest, sig)?;
                    self.cache_signer(&hash, slot, signer);
                    signer
                }
            };
            if snap.is_validator(&signer) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn cached_signer(&self, hash: &CryptoHash, slot: usize) -> Option<Address> {
        self.signatures
            .lock()
            .unwrap()
            .get(hash)
            .and_then(|recs| recs.signers.get(&slot).copied())
    }

    fn cache_signer(&self, hash: &CryptoHash, slot: usize, signer: Address) {
        let mut cache = self.signatures.lock().unwrap();
        let entry = cache.get_or_insert_mut(*hash, RecoveredSigs::default);
        entry.signers.insert(slot, signer);
    }

    fn cache_leader(&self, header: &Header, leader: Address) {
        let mut cache = self.signatures.lock().unwrap();
        let entry = cache.get_or_insert_mut(header.hash(), RecoveredSigs::default);
        entry.leader = Some(leader);
    }

    /// Retrieve the snapshot authoritative for the block *after* `(number, hash)`, deriving
    /// and caching it if necessary.
    ///
    /// The search walks backward: the in-memory cache first, the persistent store at
    /// checkpoints, the genesis extra-data at block zero. Headers gathered along the way are
    /// then applied forward onto the found snapshot, and newly crossed checkpoints are
    /// persisted.
    pub(crate) fn snapshot(
        &self,
        chain: &dyn ChainReader,
        number: BlockNumber,
        hash: CryptoHash,
        parents: &[Header],
    ) -> Result<DporSnapshot, VerifyError> {
        let mut headers: Vec<Header> = Vec::new();
        let mut number = number;
        let mut hash = hash;
        let mut parents = parents.to_vec();

        let snap = loop {
            if let Some(snap) = self.recents.lock().unwrap().get(&hash) {
                break snap.clone();
            }

            if self.config().is_checkpoint(number) {
                if let Ok(snap) = DporSnapshot::load(&*self.db.lock().unwrap(), &hash) {
                    log::debug!("LoadSnapshot, {}, {}", number, hash);
                    break snap;
                }
            }

            if number.is_genesis() {
                let genesis = chain
                    .header_by_number(BlockNumber::new(0))
                    .ok_or(VerifyError::UnknownAncestor)?;
                let snap = DporSnapshot::genesis(self.config(), genesis.hash(), &genesis.extra)
                    .map_err(VerifyError::Snapshot)?;
                snap.store(&mut *self.db.lock().unwrap())
                    .map_err(VerifyError::Snapshot)?;
                log::debug!("StoreGenesisSnapshot, {}", snap.hash());
                break snap;
            }

            // No snapshot for this block yet: gather its header and move backward.
            let header = if let Some(header) = parents.pop() {
                if header.hash() != hash || header.number != number {
                    return Err(VerifyError::UnknownAncestor);
                }
                header
            } else {
                chain.header_by_hash(&hash).ok_or(VerifyError::UnknownAncestor)?
            };
            hash = header.parent_hash;
            number = number - 1;
            headers.push(header);
        };

        // Apply the gathered headers, oldest first, on top of the found snapshot.
        headers.reverse();
        let applied = !headers.is_empty();
        let snap = snap
            .apply(&headers, self.registry().as_ref())
            .map_err(|err| match err {
                SnapshotError::NonContiguousHeaders => VerifyError::UnknownAncestor,
                other => VerifyError::Snapshot(other),
            })?;

        self.recents.lock().unwrap().put(snap.hash(), snap.clone());
        if applied && self.config().is_checkpoint(snap.number()) {
            snap.store(&mut *self.db.lock().unwrap())
                .map_err(VerifyError::Snapshot)?;
            log::debug!("StoreSnapshot, {}, {}", snap.number(), snap.hash());
        }
        Ok(snap)
    }
}
