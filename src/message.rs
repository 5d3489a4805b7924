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

use thiserror::Error;
use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message type 0x{0:04X}")]
    UnknownType(u16),
    #[error("{kind:?} payload truncated: need {needed} bytes, got {got}")]
    Truncated { kind: MessageKind, needed: usize, got: usize },
    #[error("{kind:?} payload has an unterminated name")]
    Unterminated { kind: MessageKind },
}

// ============================================================================
// Message Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    FileioReadReq,
    FileioReadResp,
    FileioReadDirReq,
    FileioReadDirResp,
    FileioWriteReq,
    FileioWriteResp,
    FileioRemove,
    FileioConfigReq,
    FileioConfigResp,
    BootloaderHandshakeDeprecated,
    BootloaderHandshakeReq,
    BootloaderHandshakeResp,
    BootloaderJumpToApp,
    Reset,
}

impl MessageKind {
    pub fn msg_type(self) -> u16 {
        match self {
            MessageKind::FileioReadReq => MSG_FILEIO_READ_REQ,
            MessageKind::FileioReadResp => MSG_FILEIO_READ_RESP,
            MessageKind::FileioReadDirReq => MSG_FILEIO_READ_DIR_REQ,
            MessageKind::FileioReadDirResp => MSG_FILEIO_READ_DIR_RESP,
            MessageKind::FileioWriteReq => MSG_FILEIO_WRITE_REQ,
            MessageKind::FileioWriteResp => MSG_FILEIO_WRITE_RESP,
            MessageKind::FileioRemove => MSG_FILEIO_REMOVE,
            MessageKind::FileioConfigReq => MSG_FILEIO_CONFIG_REQ,
            MessageKind::FileioConfigResp => MSG_FILEIO_CONFIG_RESP,
            MessageKind::BootloaderHandshakeDeprecated => MSG_BOOTLOADER_HANDSHAKE_DEP_A,
            MessageKind::BootloaderHandshakeReq => MSG_BOOTLOADER_HANDSHAKE_REQ,
            MessageKind::BootloaderHandshakeResp => MSG_BOOTLOADER_HANDSHAKE_RESP,
            MessageKind::BootloaderJumpToApp => MSG_BOOTLOADER_JUMP_TO_APP,
            MessageKind::Reset => MSG_RESET,
        }
    }

    pub fn from_msg_type(msg_type: u16) -> Option<MessageKind> {
        let kind = match msg_type {
            MSG_FILEIO_READ_REQ => MessageKind::FileioReadReq,
            MSG_FILEIO_READ_RESP => MessageKind::FileioReadResp,
            MSG_FILEIO_READ_DIR_REQ => MessageKind::FileioReadDirReq,
            MSG_FILEIO_READ_DIR_RESP => MessageKind::FileioReadDirResp,
            MSG_FILEIO_WRITE_REQ => MessageKind::FileioWriteReq,
            MSG_FILEIO_WRITE_RESP => MessageKind::FileioWriteResp,
            MSG_FILEIO_REMOVE => MessageKind::FileioRemove,
            MSG_FILEIO_CONFIG_REQ => MessageKind::FileioConfigReq,
            MSG_FILEIO_CONFIG_RESP => MessageKind::FileioConfigResp,
            MSG_BOOTLOADER_HANDSHAKE_DEP_A => MessageKind::BootloaderHandshakeDeprecated,
            MSG_BOOTLOADER_HANDSHAKE_REQ => MessageKind::BootloaderHandshakeReq,
            MSG_BOOTLOADER_HANDSHAKE_RESP => MessageKind::BootloaderHandshakeResp,
            MSG_BOOTLOADER_JUMP_TO_APP => MessageKind::BootloaderJumpToApp,
            MSG_RESET => MessageKind::Reset,
            _ => return None,
        };
        Some(kind)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A decoded message as carried by the link.
///
/// Names travel null terminated on the wire; byte blobs (`contents`, `data`,
/// `payload`, `version`) occupy whatever follows the fixed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FileioReadReq { sequence: u32, offset: u32, chunk_size: u8, filename: String },
    FileioReadResp { sequence: u32, contents: Vec<u8> },
    FileioReadDirReq { sequence: u32, offset: u32, dirname: String },
    FileioReadDirResp { sequence: u32, contents: Vec<u8> },
    FileioWriteReq { sequence: u32, offset: u32, filename: String, data: Vec<u8> },
    FileioWriteResp { sequence: u32 },
    FileioRemove { filename: String },
    FileioConfigReq { sequence: u32 },
    FileioConfigResp { sequence: u32, window_size: u32, batch_size: u32, fileio_version: u32 },
    BootloaderHandshakeDeprecated { payload: Vec<u8> },
    BootloaderHandshakeReq,
    BootloaderHandshakeResp { flags: u32, version: String },
    BootloaderJumpToApp { jump: u8 },
    Reset { flags: u32 },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::FileioReadReq { .. } => MessageKind::FileioReadReq,
            Message::FileioReadResp { .. } => MessageKind::FileioReadResp,
            Message::FileioReadDirReq { .. } => MessageKind::FileioReadDirReq,
            Message::FileioReadDirResp { .. } => MessageKind::FileioReadDirResp,
            Message::FileioWriteReq { .. } => MessageKind::FileioWriteReq,
            Message::FileioWriteResp { .. } => MessageKind::FileioWriteResp,
            Message::FileioRemove { .. } => MessageKind::FileioRemove,
            Message::FileioConfigReq { .. } => MessageKind::FileioConfigReq,
            Message::FileioConfigResp { .. } => MessageKind::FileioConfigResp,
            Message::BootloaderHandshakeDeprecated { .. } => MessageKind::BootloaderHandshakeDeprecated,
            Message::BootloaderHandshakeReq => MessageKind::BootloaderHandshakeReq,
            Message::BootloaderHandshakeResp { .. } => MessageKind::BootloaderHandshakeResp,
            Message::BootloaderJumpToApp { .. } => MessageKind::BootloaderJumpToApp,
            Message::Reset { .. } => MessageKind::Reset,
        }
    }

    /// Sequence number tying a request to its reply, if the message has one
    pub fn sequence(&self) -> Option<u32> {
        match self {
            Message::FileioReadReq { sequence, .. }
            | Message::FileioReadResp { sequence, .. }
            | Message::FileioReadDirReq { sequence, .. }
            | Message::FileioReadDirResp { sequence, .. }
            | Message::FileioWriteReq { sequence, .. }
            | Message::FileioWriteResp { sequence }
            | Message::FileioConfigReq { sequence }
            | Message::FileioConfigResp { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    pub fn offset(&self) -> Option<u32> {
        match self {
            Message::FileioReadReq { offset, .. }
            | Message::FileioReadDirReq { offset, .. }
            | Message::FileioWriteReq { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::FileioReadReq { sequence, offset, chunk_size, filename } => {
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.push(*chunk_size);
                put_name(&mut out, filename);
            }
            Message::FileioReadResp { sequence, contents }
            | Message::FileioReadDirResp { sequence, contents } => {
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(contents);
            }
            Message::FileioReadDirReq { sequence, offset, dirname } => {
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                put_name(&mut out, dirname);
            }
            Message::FileioWriteReq { sequence, offset, filename, data } => {
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                put_name(&mut out, filename);
                out.extend_from_slice(data);
            }
            Message::FileioWriteResp { sequence } | Message::FileioConfigReq { sequence } => {
                out.extend_from_slice(&sequence.to_le_bytes());
            }
            Message::FileioRemove { filename } => put_name(&mut out, filename),
            Message::FileioConfigResp { sequence, window_size, batch_size, fileio_version } => {
                for word in [sequence, window_size, batch_size, fileio_version] {
                    out.extend_from_slice(&word.to_le_bytes());
                }
            }
            Message::BootloaderHandshakeDeprecated { payload } => out.extend_from_slice(payload),
            Message::BootloaderHandshakeReq => {}
            Message::BootloaderHandshakeResp { flags, version } => {
                out.extend_from_slice(&flags.to_le_bytes());
                out.extend_from_slice(version.as_bytes());
            }
            Message::BootloaderJumpToApp { jump } => out.push(*jump),
            Message::Reset { flags } => out.extend_from_slice(&flags.to_le_bytes()),
        }
        out
    }

    pub fn decode(msg_type: u16, payload: &[u8]) -> Result<Message, DecodeError> {
        let kind = MessageKind::from_msg_type(msg_type).ok_or(DecodeError::UnknownType(msg_type))?;
        let mut r = Reader { kind, buf: payload };

        let msg = match kind {
            MessageKind::FileioReadReq => Message::FileioReadReq {
                sequence: r.u32()?,
                offset: r.u32()?,
                chunk_size: r.u8()?,
                filename: r.name()?,
            },
            MessageKind::FileioReadResp => Message::FileioReadResp {
                sequence: r.u32()?,
                contents: r.rest(),
            },
            MessageKind::FileioReadDirReq => Message::FileioReadDirReq {
                sequence: r.u32()?,
                offset: r.u32()?,
                dirname: r.name()?,
            },
            MessageKind::FileioReadDirResp => Message::FileioReadDirResp {
                sequence: r.u32()?,
                contents: r.rest(),
            },
            MessageKind::FileioWriteReq => Message::FileioWriteReq {
                sequence: r.u32()?,
                offset: r.u32()?,
                filename: r.name()?,
                data: r.rest(),
            },
            MessageKind::FileioWriteResp => Message::FileioWriteResp { sequence: r.u32()? },
            MessageKind::FileioRemove => Message::FileioRemove { filename: r.name()? },
            MessageKind::FileioConfigReq => Message::FileioConfigReq { sequence: r.u32()? },
            MessageKind::FileioConfigResp => Message::FileioConfigResp {
                sequence: r.u32()?,
                window_size: r.u32()?,
                batch_size: r.u32()?,
                fileio_version: r.u32()?,
            },
            MessageKind::BootloaderHandshakeDeprecated => {
                Message::BootloaderHandshakeDeprecated { payload: r.rest() }
            }
            MessageKind::BootloaderHandshakeReq => Message::BootloaderHandshakeReq,
            MessageKind::BootloaderHandshakeResp => Message::BootloaderHandshakeResp {
                flags: r.u32()?,
                version: String::from_utf8_lossy(&r.rest()).into_owned(),
            },
            MessageKind::BootloaderJumpToApp => Message::BootloaderJumpToApp { jump: r.u8()? },
            MessageKind::Reset => Message::Reset { flags: r.u32()? },
        };
        Ok(msg)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn put_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(name.as_bytes());
    out.push(0);
}

struct Reader<'a> {
    kind: MessageKind,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated { kind: self.kind, needed: n, got: self.buf.len() });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn name(&mut self) -> Result<String, DecodeError> {
        let end = self.buf.iter().position(|&b| b == 0)
            .ok_or(DecodeError::Unterminated { kind: self.kind })?;
        let name = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[end + 1..];
        Ok(name)
    }

    fn rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf).to_vec()
    }
}

// ============================================================================
// Tests
// ============================================================================
