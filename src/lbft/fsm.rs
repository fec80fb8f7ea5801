/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-height BFT state machine.
//!
//! Each height runs two tracks through the same five states:
//!
//! ```text
//! Idle → Preprepared → Prepared → Committed → FinalCommitted
//! ```
//!
//! The normal track starts when the height's proposer delivers a `Preprepare`; the impeachment
//! track starts when the impeach timer fires while the normal track is still below `Prepared`.
//! Both tracks race, and the first to reach `FinalCommitted` wins the height; the machine then
//! retires and the other track is discarded.
//!
//! The machine is synchronous: every input is processed to completion in arrival order, and the
//! only blocking work it performs is signature creation. Outputs are `(carrier, msg_code)` pairs
//! tagged with an [`Action`] the handler executes.

use std::sync::Arc;

use crate::errors::{FsmError, SignError};
use crate::types::{Block, BlockNumber, CryptoHash, Header};

use super::messages::{BlockOrHeader, MsgCode};
use super::DporService;

/// Phase of one track of the machine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LbftState {
    Idle,
    Preprepared,
    Prepared,
    Committed,
    FinalCommitted,
}

/// What the handler should do with a batch of outputs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Action {
    None,
    Broadcast,
    BroadcastAndInsert,
}

/// Outputs of one FSM step.
pub type Output = (Vec<(BlockOrHeader, MsgCode)>, Action);

/// Which of the two racing tracks a message belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TrackKind {
    Normal,
    Impeach,
}

impl TrackKind {
    fn of(code: MsgCode) -> TrackKind {
        if code.is_impeach() {
            TrackKind::Impeach
        } else {
            TrackKind::Normal
        }
    }

    fn prepare_code(&self) -> MsgCode {
        match self {
            TrackKind::Normal => MsgCode::Prepare,
            TrackKind::Impeach => MsgCode::ImpeachPrepare,
        }
    }

    fn commit_code(&self) -> MsgCode {
        match self {
            TrackKind::Normal => MsgCode::Commit,
            TrackKind::Impeach => MsgCode::ImpeachCommit,
        }
    }

    fn validate_code(&self) -> MsgCode {
        match self {
            TrackKind::Normal => MsgCode::Validate,
            TrackKind::Impeach => MsgCode::ImpeachValidate,
        }
    }
}

/// One track's progress: the block under consensus and the two accumulating signature vectors.
/// Prepare and commit signatures are produced over the same digest but collected separately;
/// a phase only advances on a quorum of its own vector.
struct Track {
    state: LbftState,
    block: Option<Block>,
    hash: Option<CryptoHash>,
    prepare_sigs: Option<Header>,
    commit_sigs: Option<Header>,
}

impl Track {
    fn new() -> Self {
        Self { state: LbftState::Idle, block: None, hash: None, prepare_sigs: None, commit_sigs: None }
    }
}

/// The state machine for one block height.
pub struct LbftFsm {
    number: BlockNumber,
    service: Arc<dyn DporService>,
    normal: Track,
    impeach: Track,
}

impl LbftFsm {
    pub fn new(number: BlockNumber, service: Arc<dyn DporService>) -> Self {
        Self { number, service, normal: Track::new(), impeach: Track::new() }
    }

    pub fn number(&self) -> BlockNumber {
        self.number
    }

    pub fn state(&self) -> LbftState {
        self.normal.state
    }

    pub fn impeach_state(&self) -> LbftState {
        self.impeach.state
    }

    /// The machine has delivered a block for this height; all further inputs are ignored.
    pub fn is_finalized(&self) -> bool {
        self.normal.state == LbftState::FinalCommitted
            || self.impeach.state == LbftState::FinalCommitted
    }

    /// Feed one consensus input through the machine.
    pub fn on_input(&mut self, carrier: BlockOrHeader, code: MsgCode) -> Result<Output, FsmError> {
        if carrier.number() != self.number {
            return Err(FsmError::WrongHeight { expected: self.number, got: carrier.number() });
        }
        if self.is_finalized() {
            return Ok((Vec::new(), Action::None));
        }

        let kind = TrackKind::of(code);
        match code {
            MsgCode::Preprepare | MsgCode::ImpeachPreprepare => self.on_preprepare(kind, carrier),
            MsgCode::Prepare | MsgCode::ImpeachPrepare => self.on_phase_sigs(kind, carrier, Phase::Prepare),
            MsgCode::Commit | MsgCode::ImpeachCommit => self.on_phase_sigs(kind, carrier, Phase::Commit),
            MsgCode::Validate | MsgCode::ImpeachValidate => self.on_validate(kind, carrier),
        }
    }

    /// The impeach timer fired. If the normal track is still below `Prepared` and impeachment
    /// has not started, build the empty impeach block and drive it through the impeach track.
    pub fn on_impeach_timeout(&mut self) -> Result<Output, FsmError> {
        if self.is_finalized()
            || self.normal.state >= LbftState::Prepared
            || self.impeach.state != LbftState::Idle
        {
            return Ok((Vec::new(), Action::None));
        }
        let block = self.service.create_impeach_block(self.number)?;
        self.on_preprepare(TrackKind::Impeach, block.into())
    }

    fn on_preprepare(&mut self, kind: TrackKind, carrier: BlockOrHeader) -> Result<Output, FsmError> {
        let track = match kind {
            TrackKind::Normal => &self.normal,
            TrackKind::Impeach => &self.impeach,
        };
        if track.state != LbftState::Idle {
            // The proposer rebroadcast its block; nothing new to do.
            return Ok((Vec::new(), Action::None));
        }
        let block = match carrier {
            BlockOrHeader::Block(block) => block,
            BlockOrHeader::Header(_) => {
                return Err(FsmError::UnexpectedMsg {
                    code: match kind {
                        TrackKind::Normal => MsgCode::Preprepare,
                        TrackKind::Impeach => MsgCode::ImpeachPreprepare,
                    },
                    state: track.state,
                })
            }
        };

        match kind {
            TrackKind::Normal => self.service.verify_preprepare(&block)?,
            TrackKind::Impeach => self.service.verify_impeach_preprepare(&block)?,
        }

        let mut outputs = Vec::new();
        let mut prepare_header = block.header.clone();
        let signed = self.sign_if_committee(&mut prepare_header)?;

        let track = self.track_mut(kind);
        track.hash = Some(block.hash());
        track.block = Some(block);
        track.prepare_sigs = Some(prepare_header.clone());
        track.state = LbftState::Preprepared;
        if signed {
            outputs.push((BlockOrHeader::Header(prepare_header), kind.prepare_code()));
        }

        self.try_advance(kind, &mut outputs)?;
        let action = if outputs.is_empty() { Action::None } else { Action::Broadcast };
        Ok((outputs, action))
    }

    fn on_phase_sigs(
        &mut self,
        kind: TrackKind,
        carrier: BlockOrHeader,
        phase: Phase,
    ) -> Result<Output, FsmError> {
        let header = match &carrier {
            BlockOrHeader::Header(header) => header,
            BlockOrHeader::Block(_) => {
                return Err(FsmError::UnexpectedMsg {
                    code: match phase {
                        Phase::Prepare => kind.prepare_code(),
                        Phase::Commit => kind.commit_code(),
                    },
                    state: self.track_mut(kind).state,
                })
            }
        };

        let expected_state = match phase {
            Phase::Prepare => LbftState::Preprepared,
            Phase::Commit => LbftState::Prepared,
        };
        let track = self.track_mut(kind);
        if track.state != expected_state {
            // Early, late, or duplicate phase traffic; nothing is buffered.
            return Ok((Vec::new(), Action::None));
        }
        if track.hash != Some(header.hash()) {
            return Err(FsmError::HashMismatch);
        }

        let accumulator = match phase {
            Phase::Prepare => track.prepare_sigs.as_mut().unwrap(),
            Phase::Commit => track.commit_sigs.as_mut().unwrap(),
        };
        accumulator
            .sigs
            .merge(&header.sigs)
            .map_err(FsmError::ConflictingSignature)?;

        let mut outputs = Vec::new();
        self.try_advance(kind, &mut outputs)?;
        let action = if outputs.is_empty() { Action::None } else { Action::Broadcast };
        Ok((outputs, action))
    }

    fn on_validate(&mut self, kind: TrackKind, carrier: BlockOrHeader) -> Result<Output, FsmError> {
        let block = match carrier {
            BlockOrHeader::Block(block) => block,
            BlockOrHeader::Header(_) => {
                return Err(FsmError::UnexpectedMsg {
                    code: kind.validate_code(),
                    state: self.track_mut(kind).state,
                })
            }
        };

        // A validate message is self-certifying: its vector must already carry a quorum. Any
        // replica may finalize from it, however far its own track has progressed.
        if let Some(expected) = self.track_mut(kind).hash {
            if expected != block.hash() {
                return Err(FsmError::HashMismatch);
            }
        }
        self.service.verify_validate(&block)?;

        let track = self.track_mut(kind);
        track.state = LbftState::FinalCommitted;
        track.block = Some(block.clone());
        Ok((
            vec![(BlockOrHeader::Block(block), kind.validate_code())],
            Action::BroadcastAndInsert,
        ))
    }

    /// Run quorum-driven transitions until the track can no longer advance on its own.
    fn try_advance(
        &mut self,
        kind: TrackKind,
        outputs: &mut Vec<(BlockOrHeader, MsgCode)>,
    ) -> Result<(), FsmError> {
        loop {
            let track = match kind {
                TrackKind::Normal => &self.normal,
                TrackKind::Impeach => &self.impeach,
            };
            match track.state {
                LbftState::Preprepared => {
                    let prepare_sigs = track.prepare_sigs.as_ref().unwrap();
                    let count = self.service.count_committee_sigs(prepare_sigs)?;
                    if !self.service.quorum_reached(count) {
                        return Ok(());
                    }
                    // Prepare quorum: sign and broadcast our commit.
                    let mut commit_header = track.block.as_ref().unwrap().header.clone();
                    let signed = self.sign_if_committee(&mut commit_header)?;
                    let track = self.track_mut(kind);
                    track.commit_sigs = Some(commit_header.clone());
                    track.state = LbftState::Prepared;
                    if signed {
                        outputs.push((BlockOrHeader::Header(commit_header), kind.commit_code()));
                    }
                }
                LbftState::Prepared => {
                    let commit_sigs = track.commit_sigs.as_ref().unwrap();
                    let count = self.service.count_committee_sigs(commit_sigs)?;
                    if !self.service.quorum_reached(count) {
                        return Ok(());
                    }
                    // Commit quorum: publish the block with the finalized signature vector.
                    let mut block = track.block.as_ref().unwrap().clone();
                    block.header.sigs = commit_sigs.sigs.clone();
                    let track = self.track_mut(kind);
                    track.block = Some(block.clone());
                    track.state = LbftState::Committed;
                    outputs.push((BlockOrHeader::Block(block), kind.validate_code()));
                }
                _ => return Ok(()),
            }
        }
    }

    /// Sign into the header's vector if this node is a committee member. Observers follow the
    /// protocol without contributing signatures.
    fn sign_if_committee(&self, header: &mut Header) -> Result<bool, FsmError> {
        match self.service.sign_header(header) {
            Ok(()) => Ok(true),
            Err(SignError::NotInCommittee(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn track_mut(&mut self, kind: TrackKind) -> &mut Track {
        match kind {
            TrackKind::Normal => &mut self.normal,
            TrackKind::Impeach => &mut self.impeach,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepare,
    Commit,
}
