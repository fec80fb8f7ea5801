/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A TCP-backed implementation of [`MsgReadWriter`] and the wire codec it uses.
//!
//! Frames are a 4-byte little-endian length prefix followed by the borsh encoding of a
//! [`Message`]. Frames larger than the configured limit are refused on both sides with
//! [`ProtocolError::PayloadTooLarge`]: oversized outbound messages are never sent, and an
//! oversized inbound length prefix poisons the connection without allocating.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::dialer::MsgReadWriter;
use crate::errors::ProtocolError;
use crate::lbft::messages::Message;

/// Encode a message into a length-prefixed frame.
pub fn encode_msg(msg: &Message, max_msg_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let payload = msg.try_to_vec().map_err(|_| ProtocolError::Decode)?;
    if payload.len() > max_msg_size {
        return Err(ProtocolError::PayloadTooLarge { size: payload.len(), limit: max_msg_size });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a message out of a frame payload (the bytes after the length prefix).
pub fn decode_msg(payload: &[u8], max_msg_size: usize) -> Result<Message, ProtocolError> {
    if payload.len() > max_msg_size {
        return Err(ProtocolError::PayloadTooLarge { size: payload.len(), limit: max_msg_size });
    }
    Message::try_from_slice(payload).map_err(|_| ProtocolError::Decode)
}

/// One TCP connection to a committee peer. The stream is cloned into independent read and
/// write halves so that a blocked reader never starves a writer.
pub struct TcpConn {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    max_msg_size: usize,
}

impl TcpConn {
    pub fn new(stream: TcpStream, max_msg_size: usize) -> std::io::Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self { reader: Mutex::new(reader), writer: Mutex::new(stream), max_msg_size })
    }
}

impl MsgReadWriter for TcpConn {
    fn read_msg(&self) -> Result<Message, ProtocolError> {
        let mut reader = self.reader.lock().unwrap();

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).map_err(|_| ProtocolError::Disconnected)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.max_msg_size {
            // Refuse to allocate for a hostile length; the framing is unrecoverable from here.
            reader.shutdown(Shutdown::Both).ok();
            return Err(ProtocolError::PayloadTooLarge { size: len, limit: self.max_msg_size });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).map_err(|_| ProtocolError::Disconnected)?;
        decode_msg(&payload, self.max_msg_size)
    }

    fn write_msg(&self, msg: &Message) -> Result<(), ProtocolError> {
        let frame = encode_msg(msg, self.max_msg_size)?;
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&frame).map_err(|_| ProtocolError::Disconnected)?;
        writer.flush().map_err(|_| ProtocolError::Disconnected)
    }

    fn close(&self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}
