//! Shared fixtures: an in-memory key-value store, a mock chain, a static registry, and
//! channel-backed peer connections. These simulate persistence and networking with hash maps
//! and channels, so the tests never leave artifacts.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use dpor_rs::chain::{
    CandidateRegistry, ChainReader, ChainWriter, KVGet, KVStore, NodeRegistry,
};
use dpor_rs::config::DporConfig;
use dpor_rs::dialer::MsgReadWriter;
use dpor_rs::errors::{ChainError, ProtocolError, SnapshotError};
use dpor_rs::lbft::messages::Message;
use dpor_rs::types::crypto::{sig_hash, Keypair};
use dpor_rs::types::{
    Address, Block, BlockNumber, CryptoHash, Header, Reputation, SignatureBytes, SignatureSet,
    Term, DIFF_IN_TURN,
};

static LOGGER_INIT: std::sync::Once = std::sync::Once::new();

/// Set up a logger printing all messages with level Debug and above.
pub fn setup_logger() {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    std::thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply()
            .unwrap();
    })
}

/// A simple, volatile, in-memory implementation of [`KVStore`].
#[derive(Clone)]
pub struct MemDB(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemDB {
    pub fn new() -> MemDB {
        MemDB(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl KVGet for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

impl KVStore for MemDB {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }
}

/// A deterministic keypair derived from a small seed.
pub fn keypair(seed: u8) -> Keypair {
    let mut secret = [0u8; 32];
    secret[31] = seed;
    Keypair::from_secret_bytes(&secret).expect("nonzero seeds are valid secrets")
}

/// The four-member test committee, in rotation order.
pub fn committee_keys() -> Vec<Keypair> {
    (1u8..=4).map(keypair).collect()
}

pub fn committee() -> Vec<Address> {
    committee_keys().iter().map(|kp| kp.address()).collect()
}

pub fn test_config() -> DporConfig {
    DporConfig { period: 1, epoch_length: 4, checkpoint_interval: 1_000_000 }
}

/// An in-memory chain of headers and blocks.
pub struct MockChain {
    by_hash: Mutex<HashMap<CryptoHash, Header>>,
    by_number: Mutex<HashMap<u64, CryptoHash>>,
    blocks: Mutex<HashMap<CryptoHash, Block>>,
    head: Mutex<CryptoHash>,
    pub inserted: Mutex<Vec<Block>>,
}

impl MockChain {
    /// Build a chain from a contiguous run of headers, the first of which becomes genesis.
    pub fn new(headers: Vec<Header>) -> Self {
        let chain = Self {
            by_hash: Mutex::new(HashMap::new()),
            by_number: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            head: Mutex::new(CryptoHash::zero()),
            inserted: Mutex::new(Vec::new()),
        };
        for header in headers {
            chain.extend(header);
        }
        chain
    }

    pub fn extend(&self, header: Header) {
        let hash = header.hash();
        self.by_number.lock().unwrap().insert(header.number.int(), hash);
        self.by_hash.lock().unwrap().insert(hash, header);
        *self.head.lock().unwrap() = hash;
    }
}

impl ChainReader for MockChain {
    fn current_header(&self) -> Header {
        let head = *self.head.lock().unwrap();
        self.by_hash.lock().unwrap().get(&head).cloned().expect("chain has a head")
    }

    fn header_by_hash(&self, hash: &CryptoHash) -> Option<Header> {
        self.by_hash.lock().unwrap().get(hash).cloned()
    }

    fn header_by_number(&self, number: BlockNumber) -> Option<Header> {
        let hash = *self.by_number.lock().unwrap().get(&number.int())?;
        self.header_by_hash(&hash)
    }

    fn block_by_hash(&self, hash: &CryptoHash) -> Option<Block> {
        self.blocks.lock().unwrap().get(hash).cloned()
    }
}

impl ChainWriter for MockChain {
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), (usize, ChainError)> {
        for block in blocks {
            let hash = block.hash();
            self.extend(block.header.clone());
            self.blocks.lock().unwrap().insert(hash, block.clone());
            self.inserted.lock().unwrap().push(block);
        }
        Ok(())
    }

    fn broadcast_block(&self, _block: &Block, _to_proposers_only: bool) {}
}

/// A registry whose answers are fixed up front.
pub struct StaticRegistry {
    pub candidates: Vec<(Address, Reputation)>,
    pub validators: Vec<Address>,
}

impl StaticRegistry {
    /// The usual setup: candidates are the committee itself with descending reputations, and
    /// the validator set equals the committee.
    pub fn for_committee() -> Self {
        let candidates = committee()
            .into_iter()
            .enumerate()
            .map(|(i, addr)| (addr, Reputation::new(100 - 10 * i as u64)))
            .collect();
        Self { candidates, validators: committee() }
    }

    pub fn empty() -> Self {
        Self { candidates: Vec::new(), validators: Vec::new() }
    }
}

impl CandidateRegistry for StaticRegistry {
    fn candidates_of(&self, _term: Term) -> Result<Vec<Address>, SnapshotError> {
        Ok(self.candidates.iter().map(|(addr, _)| *addr).collect())
    }

    fn reputations_of(&self, _term: Term) -> Result<Vec<(Address, Reputation)>, SnapshotError> {
        Ok(self.candidates.clone())
    }

    fn validator_set_of(&self, _term: Term) -> Result<Vec<Address>, SnapshotError> {
        Ok(self.validators.clone())
    }
}

/// A node-info registry recording submissions in memory.
pub struct MemNodeRegistry {
    pub keys: Mutex<HashMap<Address, Vec<u8>>>,
    pub node_infos: Mutex<Vec<(Term, Address, Vec<u8>)>>,
}

impl MemNodeRegistry {
    pub fn new() -> Self {
        Self { keys: Mutex::new(HashMap::new()), node_infos: Mutex::new(Vec::new()) }
    }
}

impl NodeRegistry for MemNodeRegistry {
    fn rsa_pubkey_of(&self, address: &Address) -> Option<Vec<u8>> {
        self.keys.lock().unwrap().get(address).cloned()
    }

    fn add_node_info(
        &self,
        term: Term,
        peer: &Address,
        encrypted_enode: Vec<u8>,
    ) -> Result<(), String> {
        self.node_infos.lock().unwrap().push((term, *peer, encrypted_enode));
        Ok(())
    }
}

/// One end of a bidirectional in-memory connection.
pub struct ChannelConn {
    tx: Mutex<Sender<Message>>,
    rx: Mutex<Receiver<Message>>,
}

impl ChannelConn {
    /// A connected pair of ends, like the two sides of one TCP stream.
    pub fn pair() -> (Arc<ChannelConn>, Arc<ChannelConn>) {
        let (a_tx, b_rx) = std::sync::mpsc::channel();
        let (b_tx, a_rx) = std::sync::mpsc::channel();
        (
            Arc::new(ChannelConn { tx: Mutex::new(a_tx), rx: Mutex::new(a_rx) }),
            Arc::new(ChannelConn { tx: Mutex::new(b_tx), rx: Mutex::new(b_rx) }),
        )
    }
}

impl MsgReadWriter for ChannelConn {
    fn read_msg(&self) -> Result<Message, ProtocolError> {
        self.rx.lock().unwrap().recv().map_err(|_| ProtocolError::Disconnected)
    }

    fn write_msg(&self, msg: &Message) -> Result<(), ProtocolError> {
        self.tx.lock().unwrap().send(msg.clone()).map_err(|_| ProtocolError::Disconnected)
    }

    fn close(&self) {}
}

/// The genesis header for the test committee: its extra carries the bootstrap proposers.
pub fn genesis_header(time: u64) -> Header {
    let mut header = Header::default();
    header.number = BlockNumber::new(0);
    header.time = time;
    header.extra = Header::encode_extra(b"genesis", &committee(), SignatureBytes::vacant());
    header.sigs = SignatureSet::new(4);
    header
}

/// An unsealed child of `parent` with the committee bytes filled in.
pub fn child_header(parent: &Header) -> Header {
    let mut header = Header::default();
    header.parent_hash = parent.hash();
    header.number = parent.number + 1;
    header.time = parent.time + 1;
    header.difficulty = DIFF_IN_TURN;
    header.extra = Header::encode_extra(&[], &committee(), SignatureBytes::vacant());
    header.sigs = SignatureSet::new(4);
    header
}

/// Seal a header as `leader`.
pub fn seal_header(header: &mut Header, leader: &Keypair) {
    let seal = leader.sign_hash(&sig_hash(header)).unwrap();
    header.set_leader_seal(seal);
}

/// Put `signer`'s signature into slot `slot` of the header's vector.
pub fn sign_slot(header: &mut Header, signer: &Keypair, slot: usize) {
    let sig = signer.sign_hash(&sig_hash(header)).unwrap();
    header.sigs.set(slot, sig);
}

/// A full chain of unsealed headers `0..=n`, usable as snapshot ancestry.
pub fn header_chain(n: u64, genesis_time: u64) -> Vec<Header> {
    let mut headers = vec![genesis_header(genesis_time)];
    for _ in 0..n {
        let child = child_header(headers.last().unwrap());
        headers.push(child);
    }
    headers
}
