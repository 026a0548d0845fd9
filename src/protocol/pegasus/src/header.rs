// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Zero-copy header access over a borrowed frame.
//!
//! [`HeaderView`] parses and exposes the header fields without copying the
//! packet. [`HeaderMut`] additionally rewrites fields in place, keeping the
//! frame checksum synchronized through incremental updates. This is the
//! only codec layer the load balancer data path touches.

use crate::checksum;
use crate::{FrameError, OpType, FRAME_PREFIX_LEN, HEADER_BASE_LEN, MAGIC, MAX_KEY_LEN};
use crate::{FRAMES_PARSED, FRAMES_REWRITTEN};
use common::{KeyHash, NodeId, Version};

// field offsets relative to the header (frame offset + FRAME_PREFIX_LEN)
const OFF_OP: usize = 0;
const OFF_KEYHASH: usize = 1;
const OFF_CLIENT: usize = 5;
const OFF_SERVER: usize = 6;
const OFF_LOAD: usize = 7;
const OFF_VER: usize = 9;
const OFF_KEY_LEN: usize = 13;
const OFF_KEY: usize = 15;

fn validate(frame: &[u8]) -> Result<usize, FrameError> {
    if frame.len() < FRAME_PREFIX_LEN {
        return Err(FrameError::TooShort);
    }
    if u16::from_be_bytes([frame[0], frame[1]]) != MAGIC {
        return Err(FrameError::BadMagic);
    }
    if frame.len() < FRAME_PREFIX_LEN + HEADER_BASE_LEN {
        return Err(FrameError::TooShort);
    }
    let key_len = u16::from_be_bytes([
        frame[FRAME_PREFIX_LEN + OFF_KEY_LEN],
        frame[FRAME_PREFIX_LEN + OFF_KEY_LEN + 1],
    ]) as usize;
    if key_len > MAX_KEY_LEN {
        return Err(FrameError::KeyOverrun);
    }
    if frame.len() < FRAME_PREFIX_LEN + HEADER_BASE_LEN + key_len {
        return Err(FrameError::TooShort);
    }
    if OpType::from_u8(frame[FRAME_PREFIX_LEN + OFF_OP]).is_none() {
        return Err(FrameError::BadOpType);
    }
    let stored = u16::from_be_bytes([frame[2], frame[3]]);
    let region = &frame[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + HEADER_BASE_LEN + key_len];
    if checksum::compute(region) != stored {
        return Err(FrameError::BadChecksum);
    }
    Ok(key_len)
}

/// Borrowed, read-only view of a parsed Pegasus header.
#[derive(Copy, Clone)]
pub struct HeaderView<'a> {
    frame: &'a [u8],
    key_len: usize,
}

impl<'a> HeaderView<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self, FrameError> {
        let key_len = validate(frame)?;
        FRAMES_PARSED.increment();
        Ok(Self { frame, key_len })
    }

    fn hdr(&self, off: usize) -> usize {
        FRAME_PREFIX_LEN + off
    }

    pub fn op(&self) -> OpType {
        // validated at parse
        OpType::from_u8(self.frame[self.hdr(OFF_OP)]).unwrap_or(OpType::Read)
    }

    pub fn keyhash(&self) -> KeyHash {
        let o = self.hdr(OFF_KEYHASH);
        u32::from_be_bytes([
            self.frame[o],
            self.frame[o + 1],
            self.frame[o + 2],
            self.frame[o + 3],
        ])
    }

    pub fn client_id(&self) -> u8 {
        self.frame[self.hdr(OFF_CLIENT)]
    }

    pub fn server_id(&self) -> NodeId {
        self.frame[self.hdr(OFF_SERVER)]
    }

    pub fn load(&self) -> u16 {
        let o = self.hdr(OFF_LOAD);
        u16::from_be_bytes([self.frame[o], self.frame[o + 1]])
    }

    pub fn ver(&self) -> Version {
        let o = self.hdr(OFF_VER);
        u32::from_be_bytes([
            self.frame[o],
            self.frame[o + 1],
            self.frame[o + 2],
            self.frame[o + 3],
        ])
    }

    pub fn key(&self) -> &'a [u8] {
        let o = self.hdr(OFF_KEY);
        &self.frame[o..o + self.key_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.frame[self.hdr(OFF_KEY) + self.key_len..]
    }
}

/// Mutable header access: in-place field rewrites with incremental
/// checksum maintenance.
pub struct HeaderMut<'a> {
    frame: &'a mut [u8],
    key_len: usize,
}

impl<'a> HeaderMut<'a> {
    pub fn parse(frame: &'a mut [u8]) -> Result<Self, FrameError> {
        let key_len = validate(frame)?;
        FRAMES_REWRITTEN.increment();
        Ok(Self { frame, key_len })
    }

    fn hdr(&self, off: usize) -> usize {
        FRAME_PREFIX_LEN + off
    }

    pub fn op(&self) -> OpType {
        OpType::from_u8(self.frame[self.hdr(OFF_OP)]).unwrap_or(OpType::Read)
    }

    pub fn keyhash(&self) -> KeyHash {
        let o = self.hdr(OFF_KEYHASH);
        u32::from_be_bytes([
            self.frame[o],
            self.frame[o + 1],
            self.frame[o + 2],
            self.frame[o + 3],
        ])
    }

    pub fn client_id(&self) -> u8 {
        self.frame[self.hdr(OFF_CLIENT)]
    }

    pub fn server_id(&self) -> NodeId {
        self.frame[self.hdr(OFF_SERVER)]
    }

    pub fn ver(&self) -> Version {
        let o = self.hdr(OFF_VER);
        u32::from_be_bytes([
            self.frame[o],
            self.frame[o + 1],
            self.frame[o + 2],
            self.frame[o + 3],
        ])
    }

    pub fn key(&self) -> &[u8] {
        let o = self.hdr(OFF_KEY);
        &self.frame[o..o + self.key_len]
    }

    /// Rewrite `new.len()` bytes at header offset `off`, updating the frame
    /// checksum over the affected word span only.
    fn splice(&mut self, off: usize, new: &[u8]) {
        let region_len = HEADER_BASE_LEN + self.key_len;
        let start = off & !1;
        let mut end = off + new.len();
        if end % 2 == 1 {
            end += 1;
        }
        let end = end.min(region_len);

        // widest rewritten field is 4 bytes, so a span covers at most 6
        let mut old = [0u8; 6];
        let span = end - start;
        let abs = FRAME_PREFIX_LEN + start..FRAME_PREFIX_LEN + end;
        old[..span].copy_from_slice(&self.frame[abs.clone()]);

        let dst = FRAME_PREFIX_LEN + off;
        self.frame[dst..dst + new.len()].copy_from_slice(new);

        let stored = u16::from_be_bytes([self.frame[2], self.frame[3]]);
        let updated = checksum::update(stored, &old[..span], &self.frame[abs]);
        self.frame[2..4].copy_from_slice(&updated.to_be_bytes());
    }

    pub fn set_op(&mut self, op: OpType) {
        self.splice(OFF_OP, &[op as u8]);
    }

    pub fn set_client_id(&mut self, client_id: u8) {
        self.splice(OFF_CLIENT, &[client_id]);
    }

    pub fn set_server_id(&mut self, server_id: NodeId) {
        self.splice(OFF_SERVER, &[server_id]);
    }

    pub fn set_load(&mut self, load: u16) {
        self.splice(OFF_LOAD, &load.to_be_bytes());
    }

    pub fn set_ver(&mut self, ver: Version) {
        self.splice(OFF_VER, &ver.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, Op, Request};
    use protocol_common::Compose;

    fn frame() -> Vec<u8> {
        let mut buf = Vec::new();
        Message::Request(Request {
            keyhash: 0xdead_beef,
            client_id: 3,
            server_id: 1,
            ver: 42,
            req_id: 7,
            key: (*b"somekey").into(),
            op: Op::Write((*b"value").into()),
        })
        .compose(&mut buf);
        buf
    }

    #[test]
    fn parse_roundtrip() {
        let buf = frame();
        let view = HeaderView::parse(&buf).unwrap();
        assert_eq!(view.op(), OpType::Write);
        assert_eq!(view.keyhash(), 0xdead_beef);
        assert_eq!(view.client_id(), 3);
        assert_eq!(view.server_id(), 1);
        assert_eq!(view.ver(), 42);
        assert_eq!(view.key(), b"somekey");
    }

    #[test]
    fn short_frame_is_malformed() {
        let buf = frame();
        assert_eq!(
            HeaderView::parse(&buf[..10]).unwrap_err(),
            FrameError::TooShort
        );
        assert_eq!(HeaderView::parse(&buf[..3]).unwrap_err(), FrameError::TooShort);
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut buf = frame();
        buf[0] = 0xff;
        assert_eq!(HeaderView::parse(&buf).unwrap_err(), FrameError::BadMagic);
    }

    #[test]
    fn corrupt_header_fails_checksum() {
        let mut buf = frame();
        // flip a header byte without fixing the checksum
        buf[FRAME_PREFIX_LEN + 2] ^= 0x40;
        assert_eq!(
            HeaderView::parse(&buf).unwrap_err(),
            FrameError::BadChecksum
        );
    }

    #[test]
    fn key_overrun_is_malformed() {
        let mut buf = frame();
        // claim a key longer than the frame
        buf[FRAME_PREFIX_LEN + 13] = 0xff;
        buf[FRAME_PREFIX_LEN + 14] = 0xff;
        assert!(matches!(
            HeaderView::parse(&buf).unwrap_err(),
            FrameError::KeyOverrun | FrameError::TooShort
        ));
    }

    #[test]
    fn rewrite_applies_delta_and_keeps_checksum_valid() {
        let mut buf = frame();
        {
            let mut hdr = HeaderMut::parse(&mut buf).unwrap();
            hdr.set_server_id(9);
            hdr.set_ver(100);
            hdr.set_op(OpType::Del);
            hdr.set_load(0x1234);
            hdr.set_client_id(5);
        }
        // reparse: checksum must still verify and the delta must be visible
        let view = HeaderView::parse(&buf).unwrap();
        assert_eq!(view.server_id(), 9);
        assert_eq!(view.ver(), 100);
        assert_eq!(view.op(), OpType::Del);
        assert_eq!(view.load(), 0x1234);
        assert_eq!(view.client_id(), 5);
        // untouched fields survive
        assert_eq!(view.keyhash(), 0xdead_beef);
        assert_eq!(view.key(), b"somekey");
    }

    #[test]
    fn rewrite_checksum_matches_full_recompute() {
        let mut buf = frame();
        {
            let mut hdr = HeaderMut::parse(&mut buf).unwrap();
            hdr.set_ver(0xaabb_ccdd);
        }
        let key_len = 7;
        let region = &buf[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + HEADER_BASE_LEN + key_len];
        let stored = u16::from_be_bytes([buf[2], buf[3]]);
        assert_eq!(stored, checksum::compute(region));
    }
}
