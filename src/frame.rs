// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Frame codec for the serial link
//!
//! ```text
//! 0x55 | msg_type u16 | sender u16 | len u8 | payload | crc u16
//! ```
//!
//! Integers are little endian. The CRC is CRC-16/XMODEM over everything
//! between the preamble and the CRC itself.

use tracing::debug;
use crate::protocol::MAX_PAYLOAD;

pub const PREAMBLE: u8 = 0x55;

const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub sender: u16,
    pub payload: Vec<u8>,
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// Returns `None` if the payload does not fit in one frame
pub fn encode(msg_type: u16, sender: u16, payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return None;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    out.push(PREAMBLE);
    out.extend_from_slice(&msg_type.to_le_bytes());
    out.extend_from_slice(&sender.to_le_bytes());
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    let crc = crc16(&out[1..]);
    out.extend_from_slice(&crc.to_le_bytes());
    Some(out)
}

/// Incremental decoder fed with whatever the port returns
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            match self.buf.iter().position(|&b| b == PREAMBLE) {
                Some(start) => { self.buf.drain(..start); }
                None => {
                    self.buf.clear();
                    break;
                }
            }

            if self.buf.len() < HEADER_LEN {
                break;
            }
            let len = self.buf[5] as usize;
            let total = HEADER_LEN + len + CRC_LEN;
            if self.buf.len() < total {
                break;
            }

            let expected = u16::from_le_bytes([self.buf[total - 2], self.buf[total - 1]]);
            if crc16(&self.buf[1..HEADER_LEN + len]) != expected {
                debug!(expected, "dropping frame with bad CRC");
                self.buf.drain(..1);
                continue;
            }

            frames.push(Frame {
                msg_type: u16::from_le_bytes([self.buf[1], self.buf[2]]),
                sender: u16::from_le_bytes([self.buf[3], self.buf[4]]),
                payload: self.buf[HEADER_LEN..HEADER_LEN + len].to_vec(),
            });
            self.buf.drain(..total);
        }

        frames
    }
}

// ============================================================================
// Tests
// ============================================================================
