//! The protocol handler driven end to end over a solo committee: pending-block ingress walks
//! the machine through all phases and inserts the block, far-ahead messages trigger sync
//! requests, and duplicate broadcasts are suppressed.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dpor_rs::config::HandlerConfig;
use dpor_rs::dialer::Dialer;
use dpor_rs::errors::{ChainError, SignError, VerifyError};
use dpor_rs::handler::Handler;
use dpor_rs::lbft::messages::{BlockOrHeader, Message, MsgCode};
use dpor_rs::lbft::DporService;
use dpor_rs::types::crypto::{recover, sig_hash, Keypair};
use dpor_rs::types::{
    Address, Block, BlockNumber, Header, SignatureSet, Term, DIFF_IMPEACH, DIFF_IN_TURN,
};

use common::*;

/// A committee of one: this node's own signature is a super-majority, so a block finalizes
/// without any peers.
struct SoloService {
    own: Keypair,
    current: Mutex<u64>,
    inserted: Mutex<Vec<Block>>,
    sync_requests: Mutex<Vec<Address>>,
}

impl SoloService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            own: keypair(1),
            current: Mutex::new(0),
            inserted: Mutex::new(Vec::new()),
            sync_requests: Mutex::new(Vec::new()),
        })
    }
}

impl DporService for SoloService {
    fn verify_preprepare(&self, _block: &Block) -> Result<(), VerifyError> {
        Ok(())
    }

    fn verify_impeach_preprepare(&self, block: &Block) -> Result<(), VerifyError> {
        if block.is_impeach() {
            Ok(())
        } else {
            Err(VerifyError::InvalidDifficulty)
        }
    }

    fn verify_validate(&self, block: &Block) -> Result<(), VerifyError> {
        let digest = sig_hash(&block.header);
        let count = block
            .header
            .sigs
            .iter()
            .filter(|sig| {
                !sig.is_vacant() && recover(&digest, sig) == Ok(self.own.address())
            })
            .count();
        if self.quorum_reached(count) {
            Ok(())
        } else {
            Err(VerifyError::NotEnoughSigs(block.hash()))
        }
    }

    fn sign_header(&self, header: &mut Header) -> Result<(), SignError> {
        if header.sigs.is_empty() {
            header.sigs = SignatureSet::new(1);
        }
        let sig = self.own.sign_hash(&sig_hash(header)).unwrap();
        header.sigs.set(0, sig);
        Ok(())
    }

    fn count_committee_sigs(&self, header: &Header) -> Result<usize, VerifyError> {
        let digest = sig_hash(header);
        let mut count = 0;
        for sig in header.sigs.iter() {
            if !sig.is_vacant() && recover(&digest, sig)? == self.own.address() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn quorum_reached(&self, sig_count: usize) -> bool {
        3 * sig_count > 2
    }

    fn create_impeach_block(&self, number: BlockNumber) -> Result<Block, VerifyError> {
        let mut header = Header::default();
        header.number = number;
        header.difficulty = DIFF_IMPEACH;
        header.sigs = SignatureSet::new(1);
        Ok(Block::new(header, Vec::new()))
    }

    fn impeach_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn current_number(&self) -> BlockNumber {
        BlockNumber::new(*self.current.lock().unwrap())
    }

    fn insert_chain(&self, block: Block) -> Result<(), ChainError> {
        *self.current.lock().unwrap() = block.number().int();
        self.inserted.lock().unwrap().push(block);
        Ok(())
    }

    fn broadcast_block(&self, _block: &Block, _to_proposers_only: bool) {}

    fn request_sync(&self, peer: Address) {
        self.sync_requests.lock().unwrap().push(peer);
    }

    fn term_of(&self, _number: BlockNumber) -> Term {
        Term::new(0)
    }

    fn future_term_of(&self, _number: BlockNumber) -> Term {
        Term::new(1)
    }

    fn proposers_of(&self, _number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        Ok(vec![self.own.address()])
    }

    fn validators_of(&self, _number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        Ok(vec![self.own.address()])
    }

    fn future_proposers_of(&self, number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        self.proposers_of(number)
    }

    fn future_validators_of(&self, number: BlockNumber) -> Result<Vec<Address>, VerifyError> {
        self.validators_of(number)
    }
}

fn solo_handler(service: Arc<SoloService>) -> Arc<Handler> {
    let dialer = Arc::new(Dialer::new(
        Default::default(),
        service.own.address(),
        "enode://solo@127.0.0.1:30303".to_string(),
    ));
    Arc::new(Handler::new(HandlerConfig::default(), service, dialer, None, None))
}

fn proposal(number: u64) -> Block {
    let mut header = Header::default();
    header.number = BlockNumber::new(number);
    header.time = 1_700_000_000;
    header.difficulty = DIFF_IN_TURN;
    header.sigs = SignatureSet::new(1);
    Block::new(header, Vec::new())
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn pending_block_finalizes_through_the_handler() {
    let service = SoloService::new();
    let handler = solo_handler(service.clone());
    let pending = handler.start();

    pending.send(proposal(1)).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        !service.inserted.lock().unwrap().is_empty()
    }));
    let inserted = service.inserted.lock().unwrap();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].number(), BlockNumber::new(1));
    // The finalized block carries this node's quorum-satisfying signature vector.
    assert_eq!(inserted[0].header.sigs.count(), 1);
    drop(inserted);
    assert_eq!(service.current_number(), BlockNumber::new(1));

    handler.stop();
}

#[test]
fn far_ahead_message_triggers_a_sync_request() {
    let service = SoloService::new();
    let handler = solo_handler(service.clone());

    let peer = keypair(7).address();
    let msg = Message::Consensus {
        code: MsgCode::Validate,
        carrier: BlockOrHeader::Block(proposal(5)),
    };
    handler.handle_msg(peer, msg).unwrap();

    assert_eq!(service.sync_requests.lock().unwrap().as_slice(), &[peer]);
    // The message itself is not buffered: no machine was opened for height 5.
    assert!(service.inserted.lock().unwrap().is_empty());
}

#[test]
fn outdated_messages_are_silently_dropped() {
    let service = SoloService::new();
    *service.current.lock().unwrap() = 3;
    let handler = solo_handler(service.clone());

    let peer = keypair(7).address();
    let msg = Message::Consensus {
        code: MsgCode::Prepare,
        carrier: BlockOrHeader::Header(proposal(2).header),
    };
    handler.handle_msg(peer, msg).unwrap();

    assert!(service.sync_requests.lock().unwrap().is_empty());
    assert!(service.inserted.lock().unwrap().is_empty());
}

#[test]
fn events_flow_through_the_bus() {
    use dpor_rs::event_bus::{EventBus, EventHandlers};
    use std::sync::atomic::{AtomicUsize, Ordering};

    let seen = Arc::new(AtomicUsize::new(0));
    let mut handlers = EventHandlers::with_default_loggers();
    let counter = Arc::clone(&seen);
    handlers.insert_block_handlers.push(Box::new(move |event| {
        assert_eq!(event.number, BlockNumber::new(1));
        assert!(!event.impeached);
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let bus = EventBus::start(handlers);

    let service = SoloService::new();
    let dialer = Arc::new(Dialer::new(
        Default::default(),
        service.own.address(),
        "enode://solo@127.0.0.1:30303".to_string(),
    ));
    let handler = Arc::new(Handler::new(
        HandlerConfig::default(),
        service.clone() as Arc<dyn DporService>,
        dialer,
        None,
        Some(bus.publisher()),
    ));
    let pending = handler.start();
    pending.send(proposal(1)).unwrap();

    assert!(wait_until(Duration::from_secs(5), || seen.load(Ordering::SeqCst) >= 1));
    handler.stop();
}

#[test]
fn status_reports_head_and_machine_phase() {
    let service = SoloService::new();
    let handler = solo_handler(service.clone());

    let status = handler.status();
    assert_eq!(status.head, BlockNumber::new(0));
    assert_eq!(status.state, dpor_rs::lbft::fsm::LbftState::Idle);

    // Opening the next height ahead of a proposal keeps the phase at Idle.
    handler.open_height(BlockNumber::new(1));
    let status = handler.status();
    assert_eq!(status.state, dpor_rs::lbft::fsm::LbftState::Idle);
}
