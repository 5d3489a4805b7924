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

//! Reliable file transfer and bootloader handshake for a GNSS receiver
//! reached over a link that may drop, duplicate or reorder messages.
//!
//! - [`fileio`] reads, writes, lists and removes files on the device. Reads
//!   and writes are pipelined through a [`repeater::SelectiveRepeater`].
//! - [`bootloader`] resets the device and negotiates the handshake dialect
//!   it speaks before anything else is sent.
//! - [`link`] is the boundary to the transport; [`serial::SerialLink`] is the
//!   implementation used by the command line tool.

pub mod bootloader;
pub mod config;
pub mod fileio;
pub mod frame;
pub mod gate;
pub mod link;
pub mod message;
pub mod protocol;
pub mod repeater;
pub mod sequence;
pub mod serial;

pub use bootloader::{Bootloader, BootloaderError, HandshakeInfo, ProtocolVersion};
pub use config::{BootloaderConfig, TransferConfig};
pub use fileio::{FileIo, FileIoError, WriteOptions};
pub use link::{Link, LinkError};
pub use message::{Message, MessageKind};
pub use repeater::{CancelToken, TransferError};
