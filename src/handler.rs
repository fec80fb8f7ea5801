/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The protocol handler: the glue between the peer transport, the per-height state machines,
//! and the committee overlay.
//!
//! The handler multiplexes inbound peer messages into the right [`LbftFsm`] (creating one on
//! demand for the next height), rebroadcasts FSM outputs through the [`Dialer`], drives
//! pending-block ingress from the local producer, and arms the impeachment timer for every
//! height it opens. Rebroadcast storms are suppressed with a known-block cache and a dedup
//! record keyed by `(number, hash, msg_code)`.
//!
//! Lifecycle follows the thread-and-shutdown-channel pattern: [`Handler::start`] spawns the
//! pending-block loop and the dial tick loop; dropping the handle joins them.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use lru::LruCache;

use crate::chain::NodeRegistry;
use crate::config::HandlerConfig;
use crate::dialer::{Dialer, MsgReadWriter, PeerRole};
use crate::errors::{FsmError, ProtocolError};
use crate::events::*;
use crate::lbft::fsm::{Action, LbftFsm, LbftState};
use crate::lbft::messages::{BlockOrHeader, Message, MsgCode};
use crate::lbft::DporService;
use crate::types::{Address, Block, BlockNumber, CryptoHash, Term};

/// Suppresses duplicate rebroadcasts. A message is identified by its block number, block hash,
/// and message code; payload bytes do not participate.
struct BroadcastRecord(Mutex<LruCache<(BlockNumber, CryptoHash, MsgCode), ()>>);

impl BroadcastRecord {
    fn new(capacity: usize) -> Self {
        Self(Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())))
    }

    fn mark(&self, number: BlockNumber, hash: CryptoHash, code: MsgCode) -> bool {
        let mut record = self.0.lock().unwrap();
        if record.contains(&(number, hash, code)) {
            false
        } else {
            record.put((number, hash, code), ());
            true
        }
    }
}

/// Callback used by the dial loop to open a connection to a committee member discovered
/// through the node-info registry.
pub type DialFn = Box<dyn Fn(&Address) -> Option<Arc<dyn MsgReadWriter>> + Send + Sync>;

/// A replica's consensus status.
pub struct PbftStatus {
    pub head: BlockNumber,
    pub state: LbftState,
}

/// The protocol handler for one node.
pub struct Handler {
    service: Arc<dyn DporService>,
    dialer: Arc<Dialer>,
    fsms: Mutex<HashMap<u64, LbftFsm>>,
    known_blocks: Mutex<LruCache<CryptoHash, ()>>,
    broadcast_record: BroadcastRecord,
    impeachment_record: Mutex<LruCache<(BlockNumber, CryptoHash), ()>>,
    node_registry: Option<Arc<dyn NodeRegistry>>,
    dial_fn: Mutex<Option<DialFn>>,
    pending_block_tx: Mutex<Option<Sender<Block>>>,
    event_publisher: Option<Sender<Event>>,
    running: AtomicBool,
    threads: Mutex<Vec<(Sender<()>, JoinHandle<()>)>>,
}

impl Handler {
    pub fn new(
        config: HandlerConfig,
        service: Arc<dyn DporService>,
        dialer: Arc<Dialer>,
        node_registry: Option<Arc<dyn NodeRegistry>>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            known_blocks: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.known_blocks_capacity.max(1)).unwrap(),
            )),
            broadcast_record: BroadcastRecord::new(config.broadcast_record_capacity),
            impeachment_record: Mutex::new(LruCache::new(NonZeroUsize::new(1000).unwrap())),
            service,
            dialer,
            fsms: Mutex::new(HashMap::new()),
            node_registry,
            dial_fn: Mutex::new(None),
            pending_block_tx: Mutex::new(None),
            event_publisher,
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn dialer(&self) -> &Arc<Dialer> {
        &self.dialer
    }

    /// This replica's consensus status: the chain head and the phase of the machine working on
    /// the next height.
    pub fn status(&self) -> PbftStatus {
        let head = self.service.current_number();
        let state = self
            .fsms
            .lock()
            .unwrap()
            .get(&(head + 1).int())
            .map(|fsm| fsm.state())
            .unwrap_or(LbftState::Idle);
        PbftStatus { head, state }
    }

    /// Install the connection factory the dial loop uses.
    pub fn set_dial_fn(&self, dial: DialFn) {
        *self.dial_fn.lock().unwrap() = Some(dial);
    }

    /// The channel the local producer submits sealed blocks into, once started.
    pub fn pending_block_sender(&self) -> Option<Sender<Block>> {
        self.pending_block_tx.lock().unwrap().clone()
    }

    /// Start the handler's background loops. Returns the channel the local producer submits
    /// sealed blocks into.
    pub fn start(self: &Arc<Self>) -> Sender<Block> {
        self.running.store(true, Ordering::SeqCst);

        let (pending_tx, pending_rx) = mpsc::channel::<Block>();
        *self.pending_block_tx.lock().unwrap() = Some(pending_tx.clone());

        let mut threads = self.threads.lock().unwrap();
        threads.push(self.start_pending_block_loop(pending_rx));
        threads.push(self.start_dial_loop());
        pending_tx
    }

    /// Stop the background loops and join them.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for (shutdown, handle) in threads.drain(..) {
            let _ = shutdown.send(());
            let _ = handle.join();
        }
    }

    /* ↓↓↓ Peer lifecycle ↓↓↓ */

    /// Handshake a fresh connection and, on success, register the peer and spawn its read
    /// loop. The peer must belong to the committee of the current or next term.
    pub fn handle_peer_connect(
        self: &Arc<Self>,
        conn: Arc<dyn MsgReadWriter>,
    ) -> Result<Address, ProtocolError> {
        let head = self.service.current_number();
        let proposers = self.service.proposers_of(head).unwrap_or_default();
        let validators = self.service.validators_of(head).unwrap_or_default();
        let future_proposers = self.service.future_proposers_of(head).unwrap_or_default();
        let future_validators = self.service.future_validators_of(head).unwrap_or_default();

        let verify = move |addr: &Address| {
            if validators.contains(addr) || future_validators.contains(addr) {
                Some(PeerRole::Validator)
            } else if proposers.contains(addr) || future_proposers.contains(addr) {
                Some(PeerRole::Proposer)
            } else {
                None
            }
        };

        let (role, address) = self.dialer.handshake(Arc::clone(&conn), &verify)?;
        let term = self.service.term_of(self.service.current_number());
        self.dialer.add_peer(role, address, term, Arc::clone(&conn));

        let handler = Arc::clone(self);
        thread::spawn(move || {
            loop {
                match conn.read_msg() {
                    Ok(msg) => {
                        if let Err(err) = handler.handle_msg(address, msg) {
                            log::debug!("HandleMsgError, {}, {}", address, err);
                        }
                    }
                    Err(_) => break,
                }
                if !handler.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            handler.handle_peer_disconnect(&address);
        });
        Ok(address)
    }

    pub fn handle_peer_disconnect(&self, address: &Address) {
        self.dialer.remove_peer(address);
    }

    /* ↓↓↓ Inbound dispatch ↓↓↓ */

    /// Dispatch one inbound message from `from` into the right state machine.
    pub fn handle_msg(self: &Arc<Self>, from: Address, msg: Message) -> Result<(), ProtocolError> {
        match msg {
            Message::Consensus { code, carrier } => self.handle_consensus(Some(from), code, carrier),
            Message::NewSigner(status) => {
                // A committee member announcing itself outside a handshake; track it as a
                // proposer if the current or next term lists it.
                let head = self.service.current_number();
                let proposers = self.service.proposers_of(head).unwrap_or_default();
                let future_proposers = self.service.future_proposers_of(head).unwrap_or_default();
                if proposers.contains(&status.address) || future_proposers.contains(&status.address)
                {
                    log::debug!("NewSigner, {}", status.address);
                }
                Ok(())
            }
            Message::Status(_) => Err(ProtocolError::NoStatusMsg),
        }
    }

    fn handle_consensus(
        self: &Arc<Self>,
        origin: Option<Address>,
        code: MsgCode,
        carrier: BlockOrHeader,
    ) -> Result<(), ProtocolError> {
        let number = carrier.number();
        let hash = carrier.hash();
        let current = self.service.current_number();

        Event::ReceiveMsg(ReceiveMsgEvent {
            timestamp: SystemTime::now(),
            origin,
            code,
            number,
            hash,
        })
        .publish(&self.event_publisher);

        // An impeach preprepare is only ever generated locally by the impeach timer.
        if code == MsgCode::ImpeachPreprepare && origin.is_some() {
            return Ok(());
        }

        // A proposal for a block we already proposed or inserted is rebroadcast noise.
        if origin.is_some()
            && code == MsgCode::Preprepare
            && self.known_blocks.lock().unwrap().contains(&hash)
        {
            return Ok(());
        }

        // Height ordering rules: old messages are dropped, messages from far ahead trigger a
        // sync against the sender, and only the immediately next height advances a machine.
        if number <= current {
            log::debug!("OutdatedMsg, {}, {}", number, current);
            return Ok(());
        }
        if number > current + 1 {
            if let Some(peer) = origin {
                self.service.request_sync(peer);
                Event::SyncRequest(SyncRequestEvent {
                    timestamp: SystemTime::now(),
                    peer,
                    their_number: number,
                    our_number: current,
                })
                .publish(&self.event_publisher);
            }
            return Ok(());
        }

        let step = {
            let mut fsms = self.fsms.lock().unwrap();
            if !fsms.contains_key(&number.int()) {
                // The height may have been finalized and retired while this message waited for
                // dispatch; never reopen a machine behind the chain head.
                if number <= self.service.current_number() {
                    return Ok(());
                }
                fsms.insert(number.int(), LbftFsm::new(number, Arc::clone(&self.service)));
                self.arm_impeach_timer(number);
            }
            fsms.get_mut(&number.int()).unwrap().on_input(carrier, code)
        };

        match step {
            Ok((outputs, action)) => self.dispatch_outputs(number, outputs, action),
            Err(FsmError::Verify(err)) if err.is_recoverable() => {
                log::debug!("RecoverableVerifyError, {}, {}", number, err);
                if let (crate::errors::VerifyError::UnknownAncestor, Some(peer)) = (&err, origin) {
                    self.service.request_sync(peer);
                }
                Ok(())
            }
            Err(err) => {
                log::debug!("FsmError, {}, {}", number, err);
                Ok(())
            }
        }
    }

    /// Execute one FSM step's outputs: rebroadcast, feed self-addressed messages back, insert
    /// finalized blocks.
    fn dispatch_outputs(
        self: &Arc<Self>,
        number: BlockNumber,
        outputs: Vec<(BlockOrHeader, MsgCode)>,
        action: Action,
    ) -> Result<(), ProtocolError> {
        for (carrier, code) in outputs {
            match action {
                Action::None => {}
                Action::Broadcast => {
                    self.broadcast_consensus(code, &carrier);
                    // A validate we broadcast is also addressed to ourselves; the echo drives
                    // this node's own transition into FinalCommitted.
                    if matches!(code, MsgCode::Validate | MsgCode::ImpeachValidate) {
                        self.handle_consensus(None, code, carrier)?;
                    }
                }
                Action::BroadcastAndInsert => {
                    let block = match carrier {
                        BlockOrHeader::Block(ref block) => block.clone(),
                        BlockOrHeader::Header(_) => continue,
                    };
                    self.broadcast_consensus(code, &carrier);
                    self.insert_finalized(number, block);
                }
            }
        }
        Ok(())
    }

    fn insert_finalized(self: &Arc<Self>, number: BlockNumber, block: Block) {
        let impeached = block.is_impeach();
        let hash = block.hash();
        match self.service.insert_chain(block.clone()) {
            Ok(()) => {
                self.service.broadcast_block(&block, true);
                self.known_blocks.lock().unwrap().put(hash, ());
                // Retire the height: the losing track dies with the machine.
                self.fsms.lock().unwrap().remove(&number.int());
                Event::InsertBlock(InsertBlockEvent {
                    timestamp: SystemTime::now(),
                    number,
                    hash,
                    impeached,
                })
                .publish(&self.event_publisher);
            }
            Err(err) => log::warn!("InsertChainError, {}, {}, {}", number, hash, err),
        }
    }

    fn broadcast_consensus(&self, code: MsgCode, carrier: &BlockOrHeader) {
        let number = carrier.number();
        let hash = carrier.hash();
        if !self.broadcast_record.mark(number, hash, code) {
            return;
        }
        let msg = Message::Consensus { code, carrier: carrier.clone() };
        let peers = self.dialer.broadcast_to_validators(&msg);
        Event::BroadcastMsg(BroadcastMsgEvent {
            timestamp: SystemTime::now(),
            code,
            number,
            hash,
            peers,
        })
        .publish(&self.event_publisher);
    }

    /* ↓↓↓ Impeachment ↓↓↓ */

    /// Arm the impeachment timer for a height. When it expires, the machine decides whether
    /// the normal track made enough progress; if not, the impeach track starts.
    fn arm_impeach_timer(self: &Arc<Self>, number: BlockNumber) {
        let handler = Arc::clone(self);
        let timeout = self.service.impeach_timeout();
        thread::spawn(move || {
            thread::sleep(timeout);
            if !handler.running.load(Ordering::SeqCst) {
                return;
            }
            let step = {
                let mut fsms = handler.fsms.lock().unwrap();
                match fsms.get_mut(&number.int()) {
                    Some(fsm) if !fsm.is_finalized() && fsm.state() < LbftState::Prepared => {
                        fsm.on_impeach_timeout()
                    }
                    _ => return,
                }
            };
            match step {
                Ok((outputs, action)) => {
                    if !outputs.is_empty() {
                        let hash = outputs[0].0.hash();
                        if handler
                            .impeachment_record
                            .lock()
                            .unwrap()
                            .put((number, hash), ())
                            .is_none()
                        {
                            Event::Impeach(ImpeachEvent {
                                timestamp: SystemTime::now(),
                                number,
                            })
                            .publish(&handler.event_publisher);
                        }
                    }
                    let _ = handler.dispatch_outputs(number, outputs, action);
                }
                Err(err) => log::debug!("ImpeachError, {}, {}", number, err),
            }
        });
    }

    /// Open the machine for a height without a message (used by proposers before their own
    /// preprepare), arming the impeach timer.
    pub fn open_height(self: &Arc<Self>, number: BlockNumber) {
        let mut fsms = self.fsms.lock().unwrap();
        if !fsms.contains_key(&number.int()) {
            fsms.insert(number.int(), LbftFsm::new(number, Arc::clone(&self.service)));
            self.arm_impeach_timer(number);
        }
    }

    /* ↓↓↓ Background loops ↓↓↓ */

    /// The pending-block loop: take sealed blocks from the local producer, broadcast them as
    /// preprepares, and feed them into this node's own machine.
    fn start_pending_block_loop(
        self: &Arc<Self>,
        pending: Receiver<Block>,
    ) -> (Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handler = Arc::clone(self);
        let handle = thread::spawn(move || loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {}
            }
            match pending.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(block) => {
                    let number = block.number();
                    let hash = block.hash();
                    handler.known_blocks.lock().unwrap().put(hash, ());
                    Event::Propose(ProposeEvent { timestamp: SystemTime::now(), number, hash })
                        .publish(&handler.event_publisher);
                    let carrier = BlockOrHeader::Block(block);
                    handler.broadcast_consensus(MsgCode::Preprepare, &carrier);
                    let _ = handler.handle_consensus(None, MsgCode::Preprepare, carrier);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        });
        (shutdown_tx, handle)
    }

    /// The dial loop: once per tick, check whether the chain head advanced into a new term;
    /// if so, reconcile the overlay and publish our encrypted identity for the next term.
    fn start_dial_loop(self: &Arc<Self>) -> (Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handler = Arc::clone(self);
        let tick = handler.dialer_tick();
        let handle = thread::spawn(move || {
            let mut last_term: Option<Term> = None;
            loop {
                match shutdown_rx.recv_timeout(tick) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                let head = handler.service.current_number();
                let term = handler.service.term_of(head);
                if last_term == Some(term) {
                    continue;
                }
                last_term = Some(term);
                handler.reconcile_overlay(head, term);
            }
        });
        (shutdown_tx, handle)
    }

    fn dialer_tick(&self) -> std::time::Duration {
        self.dialer.tick()
    }

    fn reconcile_overlay(&self, head: BlockNumber, term: Term) {
        let proposers = self.service.proposers_of(head).unwrap_or_default();
        let validators = self.service.validators_of(head).unwrap_or_default();
        let future_proposers = self.service.future_proposers_of(head).unwrap_or_default();
        let future_validators = self.service.future_validators_of(head).unwrap_or_default();

        let no_dial = |_: &Address| -> Option<Arc<dyn MsgReadWriter>> { None };
        let dial_fn = self.dial_fn.lock().unwrap();
        let dial: &dyn Fn(&Address) -> Option<Arc<dyn MsgReadWriter>> = match dial_fn.as_ref() {
            Some(dial) => dial.as_ref(),
            None => &no_dial,
        };
        self.dialer.update_committees(
            term,
            &proposers,
            &validators,
            &future_proposers,
            &future_validators,
            dial,
        );
        Event::UpdateCommittees(UpdateCommitteesEvent {
            timestamp: SystemTime::now(),
            term,
            proposers: self.dialer.proposer_count(),
            validators: self.dialer.validator_count(),
        })
        .publish(&self.event_publisher);

        if let Some(registry) = &self.node_registry {
            let committee: Vec<Address> = future_validators
                .iter()
                .chain(&future_proposers)
                .copied()
                .collect();
            if let Err(err) =
                self.dialer.publish_node_identity(term.next(), &committee, registry.as_ref())
            {
                log::debug!("PublishNodeIdentityError, {}, {}", term.next(), err);
            }
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.stop();
    }
}
