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

use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, info};
use crate::config::BootloaderConfig;
use crate::link::{self, Link, LinkError, Subscription};
use crate::message::{Message, MessageKind};

const HANDSHAKE_QUEUE_DEPTH: usize = 16;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum BootloaderError {
    #[error("device unreachable: no bootloader handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Link(#[from] LinkError),
}

// ============================================================================
// Handshake State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        ProtocolVersion { major, minor }
    }

    /// Major in bits 8..16, minor in bits 0..8
    pub fn from_flags(flags: u32) -> Self {
        ProtocolVersion::new((flags >> 8) as u8, flags as u8)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// First protocol version that expects the versioned handshake reply
pub const VERSIONED_HANDSHAKE: ProtocolVersion = ProtocolVersion::new(0, 45);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeState {
    pub version: Option<String>,
    pub protocol_version: ProtocolVersion,
    pub handshake_received: bool,
}

impl HandshakeState {
    pub fn observe(&mut self, msg: &Message) {
        match msg {
            Message::BootloaderHandshakeDeprecated { payload } => {
                let version = if payload.as_slice() == [0] {
                    "v0.1".to_string()
                } else {
                    String::from_utf8_lossy(payload).into_owned()
                };
                self.version = Some(version);
                self.handshake_received = true;
            }
            Message::BootloaderHandshakeResp { flags, version } => {
                self.version = Some(version.clone());
                self.protocol_version = ProtocolVersion::from_flags(*flags);
                self.handshake_received = true;
            }
            _ => {}
        }
    }

    /// The reply the device's protocol generation expects
    pub fn reply(&self) -> Message {
        if self.protocol_version < VERSIONED_HANDSHAKE {
            Message::BootloaderHandshakeDeprecated { payload: Vec::new() }
        } else {
            Message::BootloaderHandshakeReq
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub version: String,
    pub protocol_version: ProtocolVersion,
}

// ============================================================================
// States
// ============================================================================

pub struct Idle;
pub struct AwaitingHandshake;
pub struct Handshaken;
pub struct JumpedToApplication;

// ============================================================================
// FSM Structure
// ============================================================================

/// Bootloader session.
///
/// Both handshake messages are subscribed from construction until the FSM is
/// dropped, whichever state it ends in.
pub struct Bootloader<'a, L: Link + ?Sized, State> {
    state: PhantomData<State>,
    link: &'a L,
    config: BootloaderConfig,
    handshakes: Receiver<Message>,
    subscription: Subscription<'a, L>,
    handshake: HandshakeState,
}

impl<'a, L: Link + ?Sized, S> Bootloader<'a, L, S> {
    fn transition<T>(self) -> Bootloader<'a, L, T> {
        Bootloader {
            state: PhantomData,
            link: self.link,
            config: self.config,
            handshakes: self.handshakes,
            subscription: self.subscription,
            handshake: self.handshake,
        }
    }

    /// End the session and deregister the handshake callbacks
    pub fn finish(self) {}
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a, L: Link + ?Sized> Bootloader<'a, L, Idle> {
    pub fn new(link: &'a L, config: BootloaderConfig) -> Self {
        let (subscription, handshakes) = link::subscribe_channel(
            link,
            &[MessageKind::BootloaderHandshakeDeprecated, MessageKind::BootloaderHandshakeResp],
            HANDSHAKE_QUEUE_DEPTH,
        );
        Bootloader {
            state: PhantomData,
            link,
            config,
            handshakes,
            subscription,
            handshake: HandshakeState::default(),
        }
    }

    pub fn begin(self) -> Result<Bootloader<'a, L, AwaitingHandshake>, BootloaderError> {
        self.link.send(&Message::Reset { flags: 0 })?;
        info!("device reset, waiting for bootloader handshake");
        Ok(self.transition())
    }
}

impl<'a, L: Link + ?Sized> Bootloader<'a, L, AwaitingHandshake> {
    /// Wait for a handshake and answer it.
    ///
    /// The device is reset again after every `reset_period` of silence. With
    /// no `timeout` this waits for as long as it takes someone to power
    /// cycle the device.
    pub fn wait_for_handshake(
        mut self,
        timeout: Option<Duration>,
    ) -> Result<Bootloader<'a, L, Handshaken>, BootloaderError> {
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let mut expiry = start + self.config.reset_period;

        while !self.handshake.handshake_received {
            let now = Instant::now();
            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if now >= deadline {
                    return Err(BootloaderError::HandshakeTimeout(timeout));
                }
            }
            if now >= expiry {
                info!("no handshake, resetting device again");
                self.link.send(&Message::Reset { flags: 0 })?;
                expiry = now + self.config.reset_period;
            }

            let mut wait = self.config.poll_interval;
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
            match self.handshakes.recv_timeout(wait) {
                Ok(msg) => self.handshake.observe(&msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed.into()),
            }
        }

        let reply = self.handshake.reply();
        debug!(kind = ?reply.kind(), "answering handshake");
        self.link.send(&reply)?;
        info!(
            version = self.handshake.version.as_deref().unwrap_or(""),
            protocol = %self.handshake.protocol_version,
            "bootloader handshake complete"
        );
        Ok(self.transition())
    }
}

impl<'a, L: Link + ?Sized> Bootloader<'a, L, Handshaken> {
    pub fn info(&self) -> HandshakeInfo {
        HandshakeInfo {
            version: self.handshake.version.clone().unwrap_or_default(),
            protocol_version: self.handshake.protocol_version,
        }
    }

    /// Ask the bootloader to start the application. Nothing is awaited;
    /// the application announces itself with its own heartbeat.
    pub fn jump_to_app(self) -> Result<Bootloader<'a, L, JumpedToApplication>, BootloaderError> {
        self.link.send(&Message::BootloaderJumpToApp { jump: 0 })?;
        info!("jump to application sent");
        Ok(self.transition())
    }
}

/// Reset the device, complete the handshake and optionally start the application
pub fn handshake<L: Link + ?Sized>(
    link: &L,
    config: BootloaderConfig,
    timeout: Option<Duration>,
    jump: bool,
) -> Result<HandshakeInfo, BootloaderError> {
    let bootloader = Bootloader::new(link, config).begin()?.wait_for_handshake(timeout)?;
    let info = bootloader.info();
    if jump {
        bootloader.jump_to_app()?.finish();
    } else {
        bootloader.finish();
    }
    Ok(info)
}

// ============================================================================
// Tests
// ============================================================================
