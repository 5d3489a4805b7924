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

//! Protocol constants shared by the file transfer and bootloader layers

use std::time::Duration;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = 255;

/// Sender id used by the host side of the link
pub const HOST_SENDER_ID: u16 = 0x0042;

// ============================================================================
// Message type ids
// ============================================================================

/// Host requests a chunk of a file
pub const MSG_FILEIO_READ_REQ: u16 = 0x00A8;

/// Device returns a chunk of a file; shorter than requested means end of file
pub const MSG_FILEIO_READ_RESP: u16 = 0x00A3;

/// Host requests directory entries starting at an entry offset
pub const MSG_FILEIO_READ_DIR_REQ: u16 = 0x00A9;

/// Device returns null separated entry names; empty means end of listing
pub const MSG_FILEIO_READ_DIR_RESP: u16 = 0x00AA;

/// Host removes a file, no reply
pub const MSG_FILEIO_REMOVE: u16 = 0x00AC;

/// Host writes a chunk of a file at an offset
pub const MSG_FILEIO_WRITE_REQ: u16 = 0x00AD;

/// Device acknowledges a write chunk
pub const MSG_FILEIO_WRITE_RESP: u16 = 0x00AB;

/// Host asks the device for its preferred transfer window
pub const MSG_FILEIO_CONFIG_REQ: u16 = 0x1001;

/// Device reports its transfer window, batch size and fileio version
pub const MSG_FILEIO_CONFIG_RESP: u16 = 0x1002;

/// Legacy handshake, sent by old bootloaders and echoed back empty by the host
pub const MSG_BOOTLOADER_HANDSHAKE_DEP_A: u16 = 0x00B0;

/// Host tells the bootloader to start the application
pub const MSG_BOOTLOADER_JUMP_TO_APP: u16 = 0x00B1;

/// Host handshake reply for protocol 0.45 and newer
pub const MSG_BOOTLOADER_HANDSHAKE_REQ: u16 = 0x00B3;

/// Device handshake carrying its version string and protocol version flags
pub const MSG_BOOTLOADER_HANDSHAKE_RESP: u16 = 0x00B4;

/// Host resets the device
pub const MSG_RESET: u16 = 0x00B6;

// ============================================================================
// Transfer defaults
// ============================================================================

/// Requests admitted concurrently unless the device negotiates otherwise
pub const DEFAULT_WINDOW: usize = 10;

/// Upper bound accepted from window negotiation
pub const MAX_WINDOW: usize = 255;

/// Age after which an unacknowledged request is resent
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Resends allowed per request before the transfer fails
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Wait for the one reply of a non-pipelined request
pub const SINGLE_SHOT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wait for a window negotiation reply
pub const CONFIG_TIMEOUT: Duration = Duration::from_millis(500);

/// Read response overhead: the sequence number echoed ahead of the contents
pub const READ_RESP_OVERHEAD: usize = 4;

/// Write request overhead: sequence, offset and the filename terminator
pub const WRITE_REQ_OVERHEAD: usize = 9;

// ============================================================================
// Bootloader
// ============================================================================

/// How often the handshake wait checks for a reply
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for a handshake before resetting the device again
pub const HANDSHAKE_RESET_PERIOD: Duration = Duration::from_secs(15);
