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

use std::time::{Duration, Instant};
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use crate::config::TransferConfig;
use crate::link::{self, Link, LinkError};
use crate::message::{Message, MessageKind};
use crate::protocol::*;
use crate::repeater::{CancelToken, SelectiveRepeater, TransferError};
use crate::sequence::SequenceGenerator;

const REPLY_QUEUE_DEPTH: usize = 16;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum FileIoError {
    #[error("transfer of '{path}' failed: {source}")]
    Transfer { path: String, #[source] source: TransferError },
    #[error("no reply for '{path}' at offset {offset}")]
    SingleShotTimeout { path: String, offset: u32 },
    #[error("path '{path}' is {len} bytes, at most {max} fit in a request")]
    PathTooLong { path: String, len: usize, max: usize },
    #[error("'{path}' does not fit in 32 bit offsets")]
    FileTooLarge { path: String },
    #[error(transparent)]
    Link(#[from] LinkError),
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub offset: u32,
    /// Remove the file first; only honoured when writing from offset 0
    pub truncate: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { offset: 0, truncate: true }
    }
}

/// Transfer parameters reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub window_size: u32,
    pub batch_size: u32,
    pub fileio_version: u32,
}

// ============================================================================
// Reassembly
// ============================================================================

/// Read buffer filled by offset, in whatever order chunks arrive
#[derive(Debug, Default)]
pub struct Reassembly {
    data: Vec<u8>,
    eof: bool,
}

impl Reassembly {
    /// A chunk shorter than `requested` marks the end of the file.
    pub fn place(&mut self, offset: u32, contents: &[u8], requested: u8) {
        if contents.len() < requested as usize {
            self.eof = true;
        }
        if contents.is_empty() {
            return;
        }
        let start = offset as usize;
        let end = start + contents.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(contents);
    }

    pub fn is_complete(&self) -> bool {
        self.eof
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

// ============================================================================
// File I/O
// ============================================================================

/// File operations against the device's filesystem
pub struct FileIo<'a, L: Link + ?Sized> {
    link: &'a L,
    config: TransferConfig,
    sequence: SequenceGenerator,
    cancel: Option<CancelToken>,
}

impl<'a, L: Link + ?Sized> FileIo<'a, L> {
    /// The window is clamped to `1..=MAX_WINDOW`.
    pub fn new(link: &'a L, mut config: TransferConfig) -> Self {
        let window = config.window.clamp(1, MAX_WINDOW);
        if window != config.window {
            warn!(requested = config.window, window, "window out of range, clamping");
            config.window = window;
        }
        FileIo {
            link,
            config,
            sequence: SequenceGenerator::new(),
            cancel: None,
        }
    }

    pub fn with_sequence(mut self, sequence: SequenceGenerator) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    /// Ask the device for its preferred window.
    ///
    /// Firmware without window negotiation stays silent; the configured
    /// window is kept and `None` returned.
    pub fn negotiate(&mut self) -> Result<Option<DeviceConfig>, FileIoError> {
        let (_subscription, replies) =
            link::subscribe_channel(self.link, &[MessageKind::FileioConfigResp], REPLY_QUEUE_DEPTH);
        let sequence = self.sequence.next();
        self.link.send(&Message::FileioConfigReq { sequence })?;

        match await_reply(&replies, sequence, self.config.config_timeout) {
            Some(Message::FileioConfigResp { window_size, batch_size, fileio_version, .. }) => {
                self.config.window = (window_size as usize).clamp(1, MAX_WINDOW);
                info!(window = self.config.window, batch_size, fileio_version, "negotiated fileio config");
                Ok(Some(DeviceConfig { window_size, batch_size, fileio_version }))
            }
            _ => {
                debug!(window = self.config.window, "no fileio config reply, keeping default window");
                Ok(None)
            }
        }
    }

    pub fn read(&mut self, path: &str) -> Result<Vec<u8>, FileIoError> {
        // sequence, offset, chunk size and terminator precede the name
        check_name(path, 10)?;
        let chunk_size = (MAX_PAYLOAD - READ_RESP_OVERHEAD) as u8;
        let assembly = Mutex::new(Reassembly::default());
        let sequence = &mut self.sequence;

        SelectiveRepeater::run(
            self.link,
            &self.config,
            self.cancel.as_ref(),
            MessageKind::FileioReadResp,
            |request, reply| {
                if let (
                    Message::FileioReadReq { offset, chunk_size, .. },
                    Message::FileioReadResp { contents, .. },
                ) = (request, reply) {
                    assembly.lock().place(*offset, contents, *chunk_size);
                }
            },
            |repeater| {
                let mut offset: u32 = 0;
                loop {
                    let sent = repeater.send_with(|| {
                        if assembly.lock().is_complete() {
                            return None;
                        }
                        Some(Message::FileioReadReq {
                            sequence: sequence.next(),
                            offset,
                            chunk_size,
                            filename: path.to_string(),
                        })
                    })?;
                    if !sent {
                        break;
                    }
                    match offset.checked_add(chunk_size as u32) {
                        Some(next) => offset = next,
                        None => break,
                    }
                }
                repeater.flush()
            },
        ).map_err(|source| FileIoError::Transfer { path: path.to_string(), source })?;

        let assembly = assembly.into_inner();
        if !assembly.is_complete() {
            return Err(FileIoError::FileTooLarge { path: path.to_string() });
        }
        let data = assembly.into_bytes();
        debug!(path, len = data.len(), "read complete");
        Ok(data)
    }

    pub fn write(&mut self, path: &str, data: &[u8], options: WriteOptions) -> Result<(), FileIoError> {
        let chunk_size = write_chunk_size(path)?;
        if options.offset as u64 + data.len() as u64 > u32::MAX as u64 {
            return Err(FileIoError::FileTooLarge { path: path.to_string() });
        }

        if options.truncate && options.offset == 0 {
            // the write recreates the file, so a failed remove is harmless
            if let Err(e) = self.remove(path) {
                warn!(path, error = %e, "remove before write failed");
            }
        }

        // an empty write still sends one zero length chunk so the file exists
        let empty = std::iter::once(data).filter(|d| d.is_empty());
        let chunks = empty.chain(data.chunks(chunk_size));
        let sequence = &mut self.sequence;

        SelectiveRepeater::run(
            self.link,
            &self.config,
            self.cancel.as_ref(),
            MessageKind::FileioWriteResp,
            |_, _| {},
            |repeater| {
                let mut offset = options.offset;
                for chunk in chunks {
                    repeater.send(Message::FileioWriteReq {
                        sequence: sequence.next(),
                        offset,
                        filename: path.to_string(),
                        data: chunk.to_vec(),
                    })?;
                    offset += chunk.len() as u32;
                }
                repeater.flush()
            },
        ).map_err(|source| FileIoError::Transfer { path: path.to_string(), source })?;

        debug!(path, len = data.len(), offset = options.offset, "write complete");
        Ok(())
    }

    /// List a directory one reply at a time.
    ///
    /// Each request waits for its own reply; there is no resend, so a lost
    /// reply fails the listing.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<String>, FileIoError> {
        // sequence, offset and terminator precede the name
        check_name(path, 9)?;
        let (_subscription, replies) =
            link::subscribe_channel(self.link, &[MessageKind::FileioReadDirResp], REPLY_QUEUE_DEPTH);
        let mut names = Vec::new();

        loop {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(FileIoError::Transfer { path: path.to_string(), source: TransferError::Cancelled });
            }

            let sequence = self.sequence.next();
            let offset = names.len() as u32;
            self.link.send(&Message::FileioReadDirReq { sequence, offset, dirname: path.to_string() })?;

            let contents = match await_reply(&replies, sequence, self.config.single_shot_timeout) {
                Some(Message::FileioReadDirResp { contents, .. }) => contents,
                _ => return Err(FileIoError::SingleShotTimeout { path: path.to_string(), offset }),
            };

            let entries = parse_entries(&contents);
            if entries.is_empty() {
                break;
            }
            names.extend(entries);
        }

        debug!(path, entries = names.len(), "listing complete");
        Ok(names)
    }

    /// Fire and forget; removing a missing file is not an error.
    pub fn remove(&self, path: &str) -> Result<(), FileIoError> {
        self.link.send(&Message::FileioRemove { filename: path.to_string() })?;
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn check_name(path: &str, overhead: usize) -> Result<(), FileIoError> {
    let max = MAX_PAYLOAD - overhead;
    if path.len() > max {
        return Err(FileIoError::PathTooLong { path: path.to_string(), len: path.len(), max });
    }
    Ok(())
}

/// Data bytes that fit in one write request alongside `path`
fn write_chunk_size(path: &str) -> Result<usize, FileIoError> {
    check_name(path, WRITE_REQ_OVERHEAD + 1)?;
    Ok(MAX_PAYLOAD - WRITE_REQ_OVERHEAD - path.len())
}

fn parse_entries(contents: &[u8]) -> Vec<String> {
    contents
        .split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

/// Wait for the reply carrying `sequence`, skipping stale ones
fn await_reply(replies: &Receiver<Message>, sequence: u32, timeout: Duration) -> Option<Message> {
    let deadline = Instant::now() + timeout;
    loop {
        let reply = replies.recv_deadline(deadline).ok()?;
        if reply.sequence() == Some(sequence) {
            return Some(reply);
        }
        trace!(expected = sequence, got = ?reply.sequence(), "ignoring stale reply");
    }
}

// ============================================================================
// Tests
// ============================================================================
