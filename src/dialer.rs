/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The committee overlay dialer.
//!
//! Committee members keep direct connections to the proposers and validators of the current and
//! next terms. The dialer owns those peer tables, runs the two-way handshake over fresh
//! connections, and publishes this node's enode identifier to the on-chain node-info registry,
//! encrypted with each peer's registered RSA public key, so that future-term peers can find and
//! dial us.
//!
//! Transport is pluggable: the dialer talks to peers through the [`MsgReadWriter`] trait, which
//! the host's networking layer (or the test suite's channel pairs) implements.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Instant;

use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};

use crate::config::DialerConfig;
use crate::errors::{DialerError, ProtocolError};
use crate::lbft::messages::{HandshakeStatus, Message};
use crate::types::{Address, Term};

/// A bidirectional, message-oriented connection to one peer. Reads block; both halves must be
/// usable concurrently, which channel-backed implementations get for free.
///
/// Implementations own the wire framing and must refuse frames larger than
/// [`DialerConfig::max_msg_size`] with [`ProtocolError::PayloadTooLarge`].
pub trait MsgReadWriter: Send + Sync {
    fn read_msg(&self) -> Result<Message, ProtocolError>;
    fn write_msg(&self, msg: &Message) -> Result<(), ProtocolError>;
    fn close(&self);
}

/// The role a peer plays in the term its connection was established for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PeerRole {
    Proposer,
    Validator,
}

/// A connected committee member.
#[derive(Clone)]
pub struct RemoteSigner {
    pub address: Address,
    pub term: Term,
    pub conn: Arc<dyn MsgReadWriter>,
}

/// Maintains the proposer and validator peer tables for the current and next terms.
pub struct Dialer {
    config: DialerConfig,
    self_address: Address,
    /// This node's enode identifier, published to the registry for future peers.
    enode_id: String,
    proposers: RwLock<HashMap<Address, RemoteSigner>>,
    validators: RwLock<HashMap<Address, RemoteSigner>>,
}

impl Dialer {
    pub fn new(config: DialerConfig, self_address: Address, enode_id: String) -> Self {
        Self {
            config,
            self_address,
            enode_id,
            proposers: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_address(&self) -> Address {
        self.self_address
    }

    /// Interval of the head-watching tick loop.
    pub fn tick(&self) -> std::time::Duration {
        self.config.dial_tick
    }

    pub fn proposer(&self, address: &Address) -> Option<RemoteSigner> {
        self.proposers.read().unwrap().get(address).cloned()
    }

    pub fn validator(&self, address: &Address) -> Option<RemoteSigner> {
        self.validators.read().unwrap().get(address).cloned()
    }

    pub fn proposer_count(&self) -> usize {
        self.proposers.read().unwrap().len()
    }

    pub fn validator_count(&self) -> usize {
        self.validators.read().unwrap().len()
    }

    /// Register an inbound peer that passed the handshake, under the role the committee of
    /// `term` assigns it.
    pub fn add_peer(&self, role: PeerRole, address: Address, term: Term, conn: Arc<dyn MsgReadWriter>) {
        let signer = RemoteSigner { address, term, conn };
        match role {
            PeerRole::Proposer => self.proposers.write().unwrap().insert(address, signer),
            PeerRole::Validator => self.validators.write().unwrap().insert(address, signer),
        };
        log::debug!("AddPeer, {:?}, {}, {}", role, address, term);
    }

    /// Drop a disconnected peer from both tables.
    pub fn remove_peer(&self, address: &Address) {
        if let Some(peer) = self.proposers.write().unwrap().remove(address) {
            peer.conn.close();
        }
        if let Some(peer) = self.validators.write().unwrap().remove(address) {
            peer.conn.close();
        }
    }

    /// Reconcile the peer tables with the committees of `term` (current) and the next term.
    /// Members of neither term are disconnected; missing members are dialed through `dial`.
    pub fn update_committees(
        &self,
        term: Term,
        proposers: &[Address],
        validators: &[Address],
        future_proposers: &[Address],
        future_validators: &[Address],
        dial: &dyn Fn(&Address) -> Option<Arc<dyn MsgReadWriter>>,
    ) {
        let keep_proposer =
            |addr: &Address| proposers.contains(addr) || future_proposers.contains(addr);
        let keep_validator =
            |addr: &Address| validators.contains(addr) || future_validators.contains(addr);

        {
            let mut table = self.proposers.write().unwrap();
            table.retain(|addr, peer| {
                let keep = keep_proposer(addr);
                if !keep {
                    peer.conn.close();
                    log::debug!("DropPeer, proposer, {}", addr);
                }
                keep
            });
        }
        {
            let mut table = self.validators.write().unwrap();
            table.retain(|addr, peer| {
                let keep = keep_validator(addr);
                if !keep {
                    peer.conn.close();
                    log::debug!("DropPeer, validator, {}", addr);
                }
                keep
            });
        }

        for addr in proposers.iter().chain(future_proposers) {
            if *addr == self.self_address || self.proposer(addr).is_some() {
                continue;
            }
            if let Some(conn) = dial(addr) {
                self.add_peer(PeerRole::Proposer, *addr, term, conn);
            }
        }
        for addr in validators.iter().chain(future_validators) {
            if *addr == self.self_address || self.validator(addr).is_some() {
                continue;
            }
            if let Some(conn) = dial(addr) {
                self.add_peer(PeerRole::Validator, *addr, term, conn);
            }
        }
    }

    /// Publish this node's enode identifier for every member of `committee`, encrypted with the
    /// member's registered RSA public key, keyed by `(term, self, peer)` in the node-info
    /// registry.
    pub fn publish_node_identity(
        &self,
        term: Term,
        committee: &[Address],
        registry: &dyn crate::chain::NodeRegistry,
    ) -> Result<(), DialerError> {
        let mut rng = rand::thread_rng();
        for peer in committee {
            if *peer == self.self_address {
                continue;
            }
            let der = registry.rsa_pubkey_of(peer).ok_or(DialerError::NoPubkey)?;
            let pubkey =
                RsaPublicKey::from_public_key_der(&der).map_err(|_| DialerError::Encrypt)?;
            let encrypted = pubkey
                .encrypt(&mut rng, Pkcs1v15Encrypt, self.enode_id.as_bytes())
                .map_err(|_| DialerError::Encrypt)?;
            registry
                .add_node_info(term, peer, encrypted)
                .map_err(DialerError::Registry)?;
            log::debug!("PublishNodeInfo, {}, {}", term, peer);
        }
        Ok(())
    }

    /// Send a consensus message to every connected validator. Returns how many peers the write
    /// succeeded for.
    pub fn broadcast_to_validators(&self, msg: &Message) -> usize {
        let peers: Vec<RemoteSigner> = self.validators.read().unwrap().values().cloned().collect();
        peers.iter().filter(|peer| peer.conn.write_msg(msg).is_ok()).count()
    }

    /// Send a consensus message to every connected proposer.
    pub fn broadcast_to_proposers(&self, msg: &Message) -> usize {
        let peers: Vec<RemoteSigner> = self.proposers.read().unwrap().values().cloned().collect();
        peers.iter().filter(|peer| peer.conn.write_msg(msg).is_ok()).count()
    }

    /// Run the two-way handshake over a fresh connection: send our status and read the peer's,
    /// concurrently, under one deadline. The peer must speak our protocol version and be a
    /// member of the current or next term's committee, as judged by `verify`.
    pub fn handshake(
        &self,
        conn: Arc<dyn MsgReadWriter>,
        verify: &dyn Fn(&Address) -> Option<PeerRole>,
    ) -> Result<(PeerRole, Address), ProtocolError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let version = self.config.protocol_version;
        let (err_tx, err_rx) = mpsc::channel::<Result<Option<HandshakeStatus>, ProtocolError>>();

        {
            let conn = Arc::clone(&conn);
            let err_tx = err_tx.clone();
            let status = HandshakeStatus { version, address: self.self_address };
            thread::spawn(move || {
                let result = conn.write_msg(&Message::Status(status)).map(|()| None);
                let _ = err_tx.send(result);
            });
        }
        {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                let result = match conn.read_msg() {
                    Ok(Message::Status(status)) => Ok(Some(status)),
                    Ok(_) => Err(ProtocolError::NoStatusMsg),
                    Err(err) => Err(err),
                };
                let _ = err_tx.send(result);
            });
        }

        // Join the two halves on the shared deadline; any sub-failure aborts both.
        let mut peer_status = None;
        for _ in 0..2 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match err_rx.recv_timeout(remaining) {
                Ok(Ok(Some(status))) => peer_status = Some(status),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    conn.close();
                    return Err(err);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    conn.close();
                    return Err(ProtocolError::HandshakeTimeout);
                }
            }
        }
        let status = peer_status.ok_or(ProtocolError::NoStatusMsg)?;

        if status.version != version {
            conn.close();
            return Err(ProtocolError::VersionMismatch { ours: version, theirs: status.version });
        }
        match verify(&status.address) {
            Some(role) => Ok((role, status.address)),
            None => {
                conn.close();
                Err(ProtocolError::NotInCommittee)
            }
        }
    }
}
