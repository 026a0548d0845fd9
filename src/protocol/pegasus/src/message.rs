// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Owned message layer: full parse and compose of Pegasus frames,
//! including op payloads. Endpoints (client, backend kernel) use this;
//! the load balancer sticks to the borrowed header layer.

use crate::checksum;
use crate::{
    FrameError, HeaderView, OpType, ResultCode, FRAMES_COMPOSED, FRAME_PREFIX_LEN,
    HEADER_BASE_LEN, MAGIC, MAX_KEY_LEN,
};
use common::{KeyHash, NodeId, Version};
use protocol_common::{BufMut, Compose, Parse, ParseOk};

pub const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    Write(Box<[u8]>),
    Del,
}

impl Op {
    pub fn op_type(&self) -> OpType {
        match self {
            Op::Read => OpType::Read,
            Op::Write(_) => OpType::Write,
            Op::Del => OpType::Del,
        }
    }
}

/// A keyed client operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub keyhash: KeyHash,
    pub client_id: u8,
    pub server_id: NodeId,
    pub ver: Version,
    pub req_id: u32,
    pub key: Box<[u8]>,
    pub op: Op,
}

/// Server response to a keyed operation. `ver` is always the version
/// installed at the server, which is what the load balancer matches acks
/// by. The key is not echoed (`key_len = 0`); the keyhash is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub keyhash: KeyHash,
    pub client_id: u8,
    pub server_id: NodeId,
    pub load: u16,
    pub ver: Version,
    pub req_id: u32,
    pub result: ResultCode,
    pub value: Box<[u8]>,
}

/// LB -> replica: install `key` at `ver`. The authoritative owner to fetch
/// the current value from rides in the `server_id` header field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReq {
    pub keyhash: KeyHash,
    pub owner: NodeId,
    pub ver: Version,
    pub key: Box<[u8]>,
}

/// Replica -> LB: `key` is installed, insert me into the replica set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationAck {
    pub keyhash: KeyHash,
    pub server_id: NodeId,
    pub ver: Version,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetReply {
    pub result: ResultCode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    MigrationReq(MigrationReq),
    MigrationAck(MigrationAck),
    Reset,
    ResetReply(ResetReply),
}

#[allow(clippy::too_many_arguments)]
fn compose_frame(
    dst: &mut dyn BufMut,
    op: OpType,
    keyhash: KeyHash,
    client_id: u8,
    server_id: NodeId,
    load: u16,
    ver: Version,
    key: &[u8],
    payload: &[u8],
) -> usize {
    let mut header = Vec::with_capacity(HEADER_BASE_LEN + key.len());
    header.push(op as u8);
    header.extend_from_slice(&keyhash.to_be_bytes());
    header.push(client_id);
    header.push(server_id);
    header.extend_from_slice(&load.to_be_bytes());
    header.extend_from_slice(&ver.to_be_bytes());
    header.extend_from_slice(&(key.len() as u16).to_be_bytes());
    header.extend_from_slice(key);

    dst.put_slice(&MAGIC.to_be_bytes());
    dst.put_slice(&checksum::compute(&header).to_be_bytes());
    dst.put_slice(&header);
    dst.put_slice(payload);

    FRAMES_COMPOSED.increment();
    FRAME_PREFIX_LEN + header.len() + payload.len()
}

impl Compose for Message {
    fn compose(&self, dst: &mut dyn BufMut) -> usize {
        match self {
            Message::Request(r) => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&r.req_id.to_be_bytes());
                if let Op::Write(value) = &r.op {
                    payload.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    payload.extend_from_slice(value);
                }
                compose_frame(
                    dst,
                    r.op.op_type(),
                    r.keyhash,
                    r.client_id,
                    r.server_id,
                    0,
                    r.ver,
                    &r.key,
                    &payload,
                )
            }
            Message::Reply(r) => {
                let mut payload = Vec::with_capacity(9 + r.value.len());
                payload.extend_from_slice(&r.req_id.to_be_bytes());
                payload.push(r.result as u8);
                payload.extend_from_slice(&(r.value.len() as u32).to_be_bytes());
                payload.extend_from_slice(&r.value);
                compose_frame(
                    dst,
                    OpType::Reply,
                    r.keyhash,
                    r.client_id,
                    r.server_id,
                    r.load,
                    r.ver,
                    &[],
                    &payload,
                )
            }
            Message::MigrationReq(m) => compose_frame(
                dst,
                OpType::MgrReq,
                m.keyhash,
                0,
                m.owner,
                0,
                m.ver,
                &m.key,
                &[],
            ),
            Message::MigrationAck(m) => compose_frame(
                dst,
                OpType::MgrAck,
                m.keyhash,
                0,
                m.server_id,
                0,
                m.ver,
                &[],
                &[],
            ),
            Message::Reset => compose_frame(dst, OpType::Reset, 0, 0, 0, 0, 0, &[], &[]),
            Message::ResetReply(r) => compose_frame(
                dst,
                OpType::ResetReply,
                0,
                0,
                0,
                0,
                0,
                &[],
                &[r.result as u8],
            ),
        }
    }
}

#[derive(Copy, Clone)]
pub struct MessageParser {
    max_key_len: usize,
    max_value_size: usize,
}

impl MessageParser {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn max_key_len(mut self, bytes: usize) -> Self {
        self.max_key_len = bytes;
        self
    }

    pub fn max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    pub fn parse_frame(&self, frame: &[u8]) -> Result<Message, FrameError> {
        let view = HeaderView::parse(frame)?;
        if view.key().len() > self.max_key_len {
            return Err(FrameError::KeyOverrun);
        }
        let payload = view.payload();

        match view.op() {
            OpType::Read | OpType::Del => {
                let req_id = read_u32(payload, 0)?;
                Ok(Message::Request(Request {
                    keyhash: view.keyhash(),
                    client_id: view.client_id(),
                    server_id: view.server_id(),
                    ver: view.ver(),
                    req_id,
                    key: view.key().into(),
                    op: if view.op() == OpType::Read {
                        Op::Read
                    } else {
                        Op::Del
                    },
                }))
            }
            OpType::Write => {
                let req_id = read_u32(payload, 0)?;
                let value = read_value(payload, 4, self.max_value_size)?;
                Ok(Message::Request(Request {
                    keyhash: view.keyhash(),
                    client_id: view.client_id(),
                    server_id: view.server_id(),
                    ver: view.ver(),
                    req_id,
                    key: view.key().into(),
                    op: Op::Write(value),
                }))
            }
            OpType::Reply => {
                let req_id = read_u32(payload, 0)?;
                let result = payload
                    .get(4)
                    .copied()
                    .and_then(ResultCode::from_u8)
                    .ok_or(FrameError::BadPayload)?;
                let value = read_value(payload, 5, self.max_value_size)?;
                Ok(Message::Reply(Reply {
                    keyhash: view.keyhash(),
                    client_id: view.client_id(),
                    server_id: view.server_id(),
                    load: view.load(),
                    ver: view.ver(),
                    req_id,
                    result,
                    value,
                }))
            }
            OpType::MgrReq => Ok(Message::MigrationReq(MigrationReq {
                keyhash: view.keyhash(),
                owner: view.server_id(),
                ver: view.ver(),
                key: view.key().into(),
            })),
            OpType::MgrAck => Ok(Message::MigrationAck(MigrationAck {
                keyhash: view.keyhash(),
                server_id: view.server_id(),
                ver: view.ver(),
            })),
            OpType::Reset => Ok(Message::Reset),
            OpType::ResetReply => {
                let result = payload
                    .first()
                    .copied()
                    .and_then(ResultCode::from_u8)
                    .ok_or(FrameError::BadPayload)?;
                Ok(Message::ResetReply(ResetReply { result }))
            }
        }
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        Self {
            max_key_len: MAX_KEY_LEN,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

impl Parse<Message> for MessageParser {
    fn parse(&self, buffer: &[u8]) -> Result<ParseOk<Message>, std::io::Error> {
        // datagram transport: a frame is always complete, never partial
        let message = self.parse_frame(buffer)?;
        Ok(ParseOk::new(message, buffer.len()))
    }
}

fn read_u32(payload: &[u8], off: usize) -> Result<u32, FrameError> {
    let bytes = payload
        .get(off..off + 4)
        .ok_or(FrameError::BadPayload)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_value(payload: &[u8], off: usize, max: usize) -> Result<Box<[u8]>, FrameError> {
    let len = read_u32(payload, off)? as usize;
    if len > max {
        return Err(FrameError::BadPayload);
    }
    let value = payload
        .get(off + 4..off + 4 + len)
        .ok_or(FrameError::BadPayload)?;
    Ok(value.into())
}
