/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The DPoR consensus engine.
//!
//! [`Dpor`] owns the snapshot cache, the per-header signature cache, and the signed-height map,
//! and exposes the operations the host process drives block production with: header
//! verification (single and batched), block preparation, sealing, and difficulty calculation.
//! The [`DporBackend`] adapter implements [`DporService`](crate::lbft::DporService), which is
//! the face the protocol handler and the per-height state machines see.

pub mod sign;

pub mod verify;

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use threadpool::ThreadPool;

use crate::chain::{CandidateRegistry, ChainReader, ChainReadWriter, KVStore};
use crate::config::DporConfig;
use crate::errors::{ChainError, SignError, VerifyError};
use crate::lbft::DporService;
use crate::snapshot::DporSnapshot;
use crate::types::crypto::{recover, sig_hash, Keypair};
use crate::types::{
    Address, Block, BlockNumber, CryptoHash, Header, SignatureBytes, SignatureSet, Term,
    DIFF_IMPEACH, DIFF_IN_TURN, DIFF_NO_TURN,
};

/// Number of recent snapshots kept in memory.
const INMEMORY_SNAPSHOTS: usize = 1000;

/// Number of recent per-header signature records kept in memory.
const INMEMORY_SIGNATURES: usize = 1000;

/// Worker threads verifying header batches.
const VERIFY_WORKERS: usize = 4;

/// Engine variants sharing one interface. The fake variants skip signature checks
/// deterministically and exist for simulation and replay tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineMode {
    /// The real engine.
    Normal,
    /// Accept every header without any checks.
    Fake,
    /// Run structural checks but skip seal and quorum verification.
    DoNothingFake,
    /// Like `Fake`, but sleep before answering.
    FakeDelayer(Duration),
    /// Like `Fake`, but fail deterministically at one height.
    FakeFailer(BlockNumber),
}

/// Recovered signers of one header, cached so repeated verification does not repeat ECDSA
/// recovery. Grows monotonically as signatures accumulate in the vector.
#[derive(Default, Clone)]
pub(crate) struct RecoveredSigs {
    pub leader: Option<Address>,
    /// slot index → recovered signer.
    pub signers: BTreeMap<usize, Address>,
}

/// The proof-of-reputation consensus engine.
pub struct Dpor<K: KVStore> {
    config: DporConfig,
    mode: EngineMode,
    db: Mutex<K>,
    registry: Arc<dyn CandidateRegistry>,
    /// Snapshots for recent blocks, keyed by block hash.
    recents: Mutex<LruCache<CryptoHash, DporSnapshot>>,
    /// Recovered signatures of recent headers, keyed by header hash.
    signatures: Mutex<LruCache<CryptoHash, RecoveredSigs>>,
    /// Blocks this node has signed, height → hash. One signature per height, ever.
    signed_blocks: RwLock<HashMap<u64, CryptoHash>>,
    keypair: RwLock<Option<Keypair>>,
}

impl<K: KVStore> Dpor<K> {
    pub fn new(config: DporConfig, db: K, registry: Arc<dyn CandidateRegistry>) -> Self {
        Self {
            config,
            mode: EngineMode::Normal,
            db: Mutex::new(db),
            registry,
            recents: Mutex::new(LruCache::new(NonZeroUsize::new(INMEMORY_SNAPSHOTS).unwrap())),
            signatures: Mutex::new(LruCache::new(NonZeroUsize::new(INMEMORY_SIGNATURES).unwrap())),
            signed_blocks: RwLock::new(HashMap::new()),
            keypair: RwLock::new(None),
        }
    }

    /// Build an engine variant for simulation and replay tests.
    pub fn with_mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &DporConfig {
        &self.config
    }

    pub(crate) fn mode(&self) -> EngineMode {
        self.mode
    }

    pub(crate) fn registry(&self) -> &Arc<dyn CandidateRegistry> {
        &self.registry
    }

    /// Install the signing identity.
    pub fn set_keypair(&self, keypair: Keypair) {
        *self.keypair.write().unwrap() = Some(keypair);
    }

    /// This node's address, if a keypair is installed.
    pub fn address(&self) -> Option<Address> {
        self.keypair.read().unwrap().as_ref().map(|kp| kp.address())
    }

    pub(crate) fn keypair(&self) -> Result<Keypair, SignError> {
        self.keypair.read().unwrap().clone().ok_or(SignError::NoKeypair)
    }

    /// The address that sealed the given header.
    pub fn author(&self, header: &Header) -> Result<Address, VerifyError> {
        let hash = header.hash();
        if let Some(leader) = self.signatures.lock().unwrap().get(&hash).and_then(|recs| recs.leader)
        {
            return Ok(leader);
        }
        let seal = header.leader_seal().ok_or(VerifyError::MissingSignature)?;
        if seal.is_vacant() {
            return Err(VerifyError::MissingSignature);
        }
        let leader = recover(&sig_hash(header), &seal)?;
        self.signatures
            .lock()
            .unwrap()
            .get_or_insert_mut(hash, RecoveredSigs::default)
            .leader = Some(leader);
        Ok(leader)
    }

    /// The difficulty a new block on top of `parent` should carry, based on whether this node
    /// is in turn for the next height.
    pub fn calc_difficulty(
        &self,
        chain: &dyn ChainReader,
        parent: &Header,
    ) -> Result<crate::types::Difficulty, VerifyError> {
        let snap = self.snapshot(chain, parent.number, parent.hash(), &[])?;
        let own = self.address().ok_or(VerifyError::Unauthorized)?;
        let in_turn = snap
            .is_leader(&own, parent.number + 1)
            .map_err(VerifyError::Snapshot)?;
        Ok(if in_turn { DIFF_IN_TURN } else { DIFF_NO_TURN })
    }

    /// Initialize the consensus fields of a header in preparation for local execution.
    pub fn prepare_block(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), VerifyError> {
        let parent = chain
            .header_by_hash(&header.parent_hash)
            .ok_or(VerifyError::UnknownAncestor)?;
        let snap = self.snapshot(chain, parent.number, parent.hash(), &[])?;

        header.difficulty = self.calc_difficulty(chain, &parent)?;
        header.extra = Header::encode_extra(
            &header.extra.clone(),
            snap.proposers(),
            SignatureBytes::vacant(),
        );
        header.time = header.time.max(parent.time + self.config.period).max(unix_now());
        header.sigs = SignatureSet::new(self.config.epoch_length as usize);
        header.mix_hash = CryptoHash::zero();
        Ok(())
    }

    /// Assemble the final block from an executed header and its transactions.
    pub fn finalize(&self, header: Header, transactions: Vec<crate::types::Transaction>) -> Block {
        Block::new(header, transactions)
    }

    /// Seal a block with the local identity, honoring `stop` as cancellation. Blocks until the
    /// header's timestamp is reached.
    pub fn seal(
        &self,
        chain: &dyn ChainReader,
        mut block: Block,
        stop: Receiver<()>,
    ) -> Result<Block, SignError> {
        if block.number().is_genesis() {
            return Err(SignError::NotInCommittee(BlockNumber::new(0)));
        }
        let keypair = self.keypair()?;
        let parent_number = block.number() - 1;
        let snap = self
            .snapshot(chain, parent_number, block.header.parent_hash, &[])
            .map_err(|_| SignError::Snapshot(crate::errors::SnapshotError::UnknownAncestor))?;
        if !snap.is_proposer(&keypair.address()) {
            return Err(SignError::NotInCommittee(block.number()));
        }

        // Wait out the block period; the stop signal aborts the seal. A dropped stop handle
        // means the host never intends to cancel.
        let delay = block.header.time.saturating_sub(unix_now());
        if delay > 0 {
            match stop.recv_timeout(Duration::from_secs(delay)) {
                Ok(()) => return Err(SignError::Aborted),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    thread::sleep(Duration::from_secs(delay))
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        } else if stop.try_recv().is_ok() {
            return Err(SignError::Aborted);
        }

        let seal = keypair.sign_hash(&sig_hash(&block.header))?;
        block.header.set_leader_seal(seal);
        Ok(block)
    }

    /// Verify a batch of headers concurrently. Returns a cancel channel and a result channel
    /// whose entries correspond, in order, to the input slice.
    pub fn verify_headers(
        self: &Arc<Self>,
        chain: Arc<dyn ChainReader>,
        headers: Vec<Header>,
        seals: Vec<bool>,
    ) -> (Sender<()>, Receiver<Result<(), VerifyError>>) {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let (result_tx, result_rx) = mpsc::channel();

        let engine = Arc::clone(self);
        thread::spawn(move || {
            let pool = ThreadPool::new(VERIFY_WORKERS);
            let (done_tx, done_rx) = mpsc::channel::<(usize, Result<(), VerifyError>)>();

            let total = headers.len();
            let headers = Arc::new(headers);
            for index in 0..total {
                let engine = Arc::clone(&engine);
                let chain = Arc::clone(&chain);
                let headers = Arc::clone(&headers);
                let seal = seals.get(index).copied().unwrap_or(true);
                let done = done_tx.clone();
                pool.execute(move || {
                    let parents = &headers[..index];
                    let result = engine.verify_header(chain.as_ref(), &headers[index], seal, parents);
                    let _ = done.send((index, result));
                });
            }
            drop(done_tx);

            // Forward results in input order, whatever order the workers finish in.
            let mut pending: BTreeMap<usize, Result<(), VerifyError>> = BTreeMap::new();
            let mut next = 0;
            while next < total {
                match cancel_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => {}
                }
                match done_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok((index, result)) => {
                        pending.insert(index, result);
                        while let Some(result) = pending.remove(&next) {
                            if result_tx.send(result).is_err() {
                                return;
                            }
                            next += 1;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => return,
                }
            }
        });

        (cancel_tx, result_rx)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Binds the engine to a concrete chain, forming the service the protocol handler and the
/// state machines consume.
pub struct DporBackend<K: KVStore, C: ChainReadWriter> {
    engine: Arc<Dpor<K>>,
    chain: Arc<C>,
    impeach_timeout: Duration,
    /// Invoked when a peer is ahead of us and a sync should start. Installed by the host.
    sync_hook: Mutex<Option<Box<dyn Fn(Address) + Send + Sync>>>,
}

impl<K: KVStore, C: ChainReadWriter> DporBackend<K, C> {
    pub fn new(engine: Arc<Dpor<K>>, chain: Arc<C>, impeach_timeout: Duration) -> Self {
        Self { engine, chain, impeach_timeout, sync_hook: Mutex::new(None) }
    }

    pub fn engine(&self) -> &Arc<Dpor<K>> {
        &self.engine
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn set_sync_hook(&self, hook: Box<dyn Fn(Address) + Send + Sync>) {
        *self.sync_hook.lock().unwrap() = Some(hook);
    }
}

impl<K: KVStore, C: ChainReadWriter + 'static> DporService for DporBackend<K, C> {
    fn verify_preprepare(&self, block: &Block) -> Result<(), VerifyError> {
        self.engine
            .verify_header_inner(self.chain.as_ref(), &block.header, &[], verify::SealCheck::Leader)
    }

    fn verify_impeach_preprepare(&self, block: &Block) -> Result<(), VerifyError> {
        if !block.is_impeach() {
            return Err(VerifyError::InvalidDifficulty);
        }
        self.engine
            .verify_header_inner(self.chain.as_ref(), &block.header, &[], verify::SealCheck::None)
    }

    fn verify_validate(&self, block: &Block) -> Result<(), VerifyError> {
        let check = if block.is_impeach() {
            verify::SealCheck::QuorumOnly
        } else {
            verify::SealCheck::LeaderAndQuorum
        };
        self.engine
            .verify_header_inner(self.chain.as_ref(), &block.header, &[], check)
    }

    fn sign_header(&self, header: &mut Header) -> Result<(), SignError> {
        self.engine.sign_header(self.chain.as_ref(), header)
    }

    fn count_committee_sigs(&self, header: &Header) -> Result<usize, VerifyError> {
        self.engine.count_committee_sigs(self.chain.as_ref(), header)
    }

    fn quorum_reached(&self, sig_count: usize) -> bool {
        3 * sig_count as u64 > 2 * self.engine.config.epoch_length
    }

    fn create_impeach_block(&self, number: BlockNumber) -> Result<Block, VerifyError> {
        let parent = self
            .chain
            .header_by_number(number - 1)
            .ok_or(VerifyError::UnknownAncestor)?;
        let snap = self
            .engine
            .snapshot(self.chain.as_ref(), parent.number, parent.hash(), &[])?;

        let mut header = Header::default();
        header.parent_hash = parent.hash();
        header.coinbase = Address::zero();
        header.number = number;
        header.time = parent.time + self.engine.config.period;
        header.difficulty = DIFF_IMPEACH;
        header.extra = Header::encode_extra(&[], snap.proposers(), SignatureBytes::vacant());
        header.sigs = SignatureSet::new(self.engine.config.epoch_length as usize);
        Ok(Block::new(header, Vec::new()))
    }

    fn impeach_timeout(&self) -> Duration {
        self.impeach_timeout
    }

    fn current_number(&self) -> BlockNumber {
        self.chain.current_header().number
    }

    fn insert_chain(&self, block: Block) -> Result<(), ChainError> {
        self.chain.insert_chain(vec![block]).map_err(|(_, err)| err)
    }

    fn broadcast_block(&self, block: &Block, to_proposers_only: bool) {
        self.chain.broadcast_block(block, to_proposers_only)
    }

    fn request_sync(&self, peer: Address) {
        if let Some(hook) = self.sync_hook.lock().unwrap().as_ref() {
            hook(peer)
        } else {
            log::debug!("RequestSync, {}, no sync hook installed", peer);
        }
    }

    fn term_of(&self, number: BlockNumber) -> Term {
        self.engine.config.term_of(number)
    }

    fn future_term_of(&self, number: BlockNumber) -> Term {
        self.engine.config.future_term_of(number)
    }

    fn proposers_of(&self, _number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        let head = self.chain.current_header();
        let snap = self.engine.snapshot(self.chain.as_ref(), head.number, head.hash(), &[])?;
        Ok(snap.proposers().to_vec())
    }

    fn validators_of(&self, _number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        let head = self.chain.current_header();
        let snap = self.engine.snapshot(self.chain.as_ref(), head.number, head.hash(), &[])?;
        Ok(snap.validators().to_vec())
    }

    fn future_proposers_of(&self, _number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        let head = self.chain.current_header();
        let snap = self.engine.snapshot(self.chain.as_ref(), head.number, head.hash(), &[])?;
        Ok(snap.future_proposers().to_vec())
    }

    fn future_validators_of(&self, _number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        let head = self.chain.current_header();
        let snap = self.engine.snapshot(self.chain.as_ref(), head.number, head.hash(), &[])?;
        Ok(snap.future_validators().to_vec())
    }
}
