/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signing a header as a committee member.
//!
//! A node signs at most one block hash per height, ever. The witness is a process-wide map from
//! height to the signed hash; attempting to sign a different hash at a recorded height fails
//! with [`SignError::DoubleSignAttempt`] and the first signature stands.

use crate::chain::{ChainReader, KVStore};
use crate::errors::SignError;
use crate::types::crypto::sig_hash;
use crate::types::Header;

use super::Dpor;

impl<K: KVStore> Dpor<K> {
    /// Sign `header` and place the signature into this node's rotation slot of the signature
    /// vector, preserving every other slot.
    pub fn sign_header(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), SignError> {
        if header.number.is_genesis() {
            return Err(SignError::NotInCommittee(header.number));
        }
        let keypair = self.keypair()?;
        let snap = self
            .snapshot(chain, header.number - 1, header.parent_hash, &[])
            .map_err(|_| SignError::Snapshot(crate::errors::SnapshotError::UnknownAncestor))?;

        if !snap.is_validator(&keypair.address()) {
            return Err(SignError::NotInCommittee(header.number));
        }
        let round = snap.signer_round(&keypair.address())?;

        let hash = header.hash();
        {
            let mut signed = self.signed_blocks.write().unwrap();
            match signed.get(&header.number.int()) {
                Some(recorded) if *recorded != hash => {
                    return Err(SignError::DoubleSignAttempt {
                        number: header.number,
                        signed: *recorded,
                    })
                }
                Some(_) => {}
                None => {
                    signed.insert(header.number.int(), hash);
                }
            }
        }

        if header.sigs.is_empty() {
            header.sigs = crate::types::SignatureSet::new(self.config().epoch_length as usize);
        }
        let signature = keypair.sign_hash(&sig_hash(header))?;
        let slot = round % header.sigs.len();
        header.sigs.set(slot, signature);
        Ok(())
    }
}
