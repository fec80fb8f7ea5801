/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives: the digest that committee members sign, recoverable ECDSA signing,
//! and public-key recovery back to a 20-byte address.
//!
//! The two header digests differ only in how much of the header they cover:
//! - [`header_hash`]: everything except the signature vector. The identity of a header.
//! - [`sig_hash`]: additionally excludes the trailing 65 seal bytes of `extra`. The same header
//!   therefore hashes identically before and after the leader seals it, which is what lets the
//!   leader seal and the validator signatures all commit to one digest.

use borsh::BorshSerialize;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};

use crate::errors::CryptoError;

use super::basic::*;
use super::header::{Header, EXTRA_SEAL};

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> CryptoHash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    CryptoHash::new(hasher.finalize().into())
}

fn hash_header_fields(header: &Header, extra: &[u8]) -> CryptoHash {
    let mut hasher = Keccak256::new();
    hasher.update(header.parent_hash.try_to_vec().unwrap());
    hasher.update(header.coinbase.try_to_vec().unwrap());
    hasher.update(header.state_root.try_to_vec().unwrap());
    hasher.update(header.txs_root.try_to_vec().unwrap());
    hasher.update(header.receipts_root.try_to_vec().unwrap());
    hasher.update(header.number.try_to_vec().unwrap());
    hasher.update(header.time.try_to_vec().unwrap());
    hasher.update(header.difficulty.try_to_vec().unwrap());
    hasher.update(extra.to_vec().try_to_vec().unwrap());
    hasher.update(header.mix_hash.try_to_vec().unwrap());
    CryptoHash::new(hasher.finalize().into())
}

/// The identity of a header: a digest over every field except the signature vector.
pub fn header_hash(header: &Header) -> CryptoHash {
    hash_header_fields(header, &header.extra)
}

/// The digest that both the leader seal and the validator signatures are produced over. Covers
/// the header with the trailing 65 bytes of `extra` zeroed out and the signature vector omitted.
pub fn sig_hash(header: &Header) -> CryptoHash {
    if header.extra.len() < EXTRA_SEAL {
        return hash_header_fields(header, &header.extra);
    }
    let mut extra = header.extra.clone();
    let at = extra.len() - EXTRA_SEAL;
    extra[at..].fill(0);
    hash_header_fields(header, &extra)
}

/// The address of a public key: the low 20 bytes of the Keccak-256 digest of the uncompressed
/// point, tag byte stripped.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&digest.bytes()[12..32]).unwrap()
}

/// Recover the signer's address from a 65-byte recoverable signature over `hash`.
pub fn recover(hash: &CryptoHash, sig: &SignatureBytes) -> Result<Address, CryptoError> {
    let bytes = sig.bytes();
    let signature = Signature::from_slice(&bytes[..64]).map_err(|_| CryptoError::BadSignature)?;
    let recovery_id = RecoveryId::from_byte(bytes[64]).ok_or(CryptoError::BadSignature)?;
    let key = VerifyingKey::recover_from_prehash(&hash.bytes(), &signature, recovery_id)
        .map_err(|_| CryptoError::BadSignature)?;
    Ok(address_of(&key))
}

/// A secp256k1 keypair identifying one node.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    address: Address,
}

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Self {
        let address = address_of(signing_key.verifying_key());
        Self { signing_key, address }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes).map_err(|_| CryptoError::BadSecretKey)?;
        Ok(Self::new(signing_key))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Produce a 65-byte recoverable signature over a 32-byte digest.
    pub fn sign_hash(&self, hash: &CryptoHash) -> Result<SignatureBytes, CryptoError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&hash.bytes())
            .map_err(|_| CryptoError::SigningFailed)?;
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes[..64].copy_from_slice(signature.to_bytes().as_slice());
        bytes[64] = recovery_id.to_byte();
        Ok(SignatureBytes::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::header::Header;

    fn keypair(seed: u8) -> Keypair {
        let mut secret = [0u8; 32];
        secret[31] = seed;
        Keypair::from_secret_bytes(&secret).unwrap()
    }

    fn sealed_header() -> Header {
        let mut header = Header::default();
        header.number = BlockNumber::new(5);
        header.time = 1_700_000_000;
        header.difficulty = DIFF_IN_TURN;
        header.extra = Header::encode_extra(
            b"test",
            &[Address::new([1; ADDRESS_LENGTH])],
            SignatureBytes::vacant(),
        );
        header.sigs = SignatureSet::new(4);
        header
    }

    #[test]
    fn sign_then_recover_yields_the_signer_address() {
        let kp = keypair(42);
        let digest = keccak256(b"some message");
        let sig = kp.sign_hash(&digest).unwrap();
        assert_eq!(recover(&digest, &sig).unwrap(), kp.address());
    }

    #[test]
    fn recover_rejects_garbage() {
        let digest = keccak256(b"some message");
        let garbage = SignatureBytes::new([0xff; SIGNATURE_LENGTH]);
        assert!(recover(&digest, &garbage).is_err());
    }

    #[test]
    fn sig_hash_ignores_the_seal_and_the_signature_vector() {
        let mut header = sealed_header();
        let before = sig_hash(&header);

        header.set_leader_seal(SignatureBytes::new([0xab; SIGNATURE_LENGTH]));
        header.sigs.set(0, SignatureBytes::new([0xcd; SIGNATURE_LENGTH]));

        assert_eq!(sig_hash(&header), before);
    }

    #[test]
    fn header_hash_ignores_the_signature_vector_but_not_the_seal() {
        let mut header = sealed_header();
        let before = header.hash();

        header.sigs.set(0, SignatureBytes::new([0xcd; SIGNATURE_LENGTH]));
        assert_eq!(header.hash(), before);

        header.set_leader_seal(SignatureBytes::new([0xab; SIGNATURE_LENGTH]));
        assert_ne!(header.hash(), before);
    }

    #[test]
    fn sig_hash_is_sensitive_to_consensus_fields() {
        let header = sealed_header();
        let mut other = header.clone();
        other.number = BlockNumber::new(6);
        assert_ne!(sig_hash(&header), sig_hash(&other));
    }
}
