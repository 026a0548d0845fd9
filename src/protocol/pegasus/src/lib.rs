// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A protocol crate for the Pegasus wire format.
//!
//! The format is a fixed-layout binary header carried in a UDP datagram:
//!
//! ```text
//! offset  bytes  field
//! 0       2      magic (0x5047)
//! 2       2      frame checksum (internet checksum over the header)
//! 4       1      op_type
//! 5       4      keyhash
//! 9       1      client_id
//! 10      1      server_id
//! 11      2      load
//! 13      4      ver
//! 17      2      key_len
//! 19      L      key
//! 19+L    ...    op payload
//! ```
//!
//! Two codec layers are provided. [`HeaderView`] and [`HeaderMut`] operate
//! on a borrowed frame without copying and are what the load balancer data
//! path uses: parse, rewrite a handful of fields in place, and update the
//! frame checksum incrementally. [`Message`] and [`MessageParser`] are the
//! owned-message layer used by the endpoints, which need the op payloads
//! as well as the header.

use rustcommon_metrics::*;

mod checksum;
mod header;
mod message;

pub use checksum::{compute, update};
pub use header::{HeaderMut, HeaderView};
pub use message::{
    Message, MessageParser, MigrationAck, MigrationReq, Op, Reply, Request, ResetReply,
};

counter!(FRAMES_PARSED);
counter!(FRAMES_COMPOSED);
counter!(FRAMES_REWRITTEN);

/// Protocol tag carried in the first two bytes of every frame.
pub const MAGIC: u16 = 0x5047;

/// Bytes preceding the Pegasus header: magic + frame checksum.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Fixed portion of the Pegasus header, before the variable-length key.
pub const HEADER_BASE_LEN: usize = 15;

/// Keys longer than this are rejected as malformed.
pub const MAX_KEY_LEN: usize = 255;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Read = 0,
    Write = 1,
    Del = 2,
    MgrReq = 3,
    MgrAck = 4,
    Reply = 5,
    Reset = 6,
    ResetReply = 7,
}

impl OpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpType::Read),
            1 => Some(OpType::Write),
            2 => Some(OpType::Del),
            3 => Some(OpType::MgrReq),
            4 => Some(OpType::MgrAck),
            5 => Some(OpType::Reply),
            6 => Some(OpType::Reset),
            7 => Some(OpType::ResetReply),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    NotFound = 1,
}

impl ResultCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResultCode::Ok),
            1 => Some(ResultCode::NotFound),
            _ => None,
        }
    }
}

/// Reasons a frame fails to parse. The load balancer treats every variant
/// the same way (count and pass over); the endpoints surface them as
/// `InvalidInput`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    TooShort,
    BadMagic,
    BadChecksum,
    BadOpType,
    KeyOverrun,
    BadPayload,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "frame shorter than header"),
            FrameError::BadMagic => write!(f, "protocol tag mismatch"),
            FrameError::BadChecksum => write!(f, "frame checksum mismatch"),
            FrameError::BadOpType => write!(f, "unknown op type"),
            FrameError::KeyOverrun => write!(f, "key length exceeds frame or limit"),
            FrameError::BadPayload => write!(f, "op payload truncated"),
        }
    }
}

impl From<FrameError> for std::io::Error {
    fn from(err: FrameError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string())
    }
}
