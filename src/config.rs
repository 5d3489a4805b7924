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

use std::time::Duration;
use crate::protocol::*;

/// Timing and window settings for file transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Requests admitted concurrently
    pub window: usize,
    /// Age after which an unanswered request is resent
    pub timeout: Duration,
    /// Resends per request before giving up
    pub max_retries: u8,
    /// Wait for the reply of a non-pipelined request
    pub single_shot_timeout: Duration,
    /// Wait for a window negotiation reply
    pub config_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            single_shot_timeout: SINGLE_SHOT_TIMEOUT,
            config_timeout: CONFIG_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderConfig {
    pub poll_interval: Duration,
    /// Handshake silence after which the device is reset again
    pub reset_period: Duration,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: HANDSHAKE_POLL_INTERVAL,
            reset_period: HANDSHAKE_RESET_PERIOD,
        }
    }
}
