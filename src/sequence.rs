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

use rand::Rng;

/// Source of request sequence numbers.
///
/// Starts at a random value so two sessions sharing a link are unlikely to
/// reuse each other's numbers, then counts up and wraps.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: u32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(rand::rng().random())
    }

    pub fn starting_at(first: u32) -> Self {
        SequenceGenerator { next: first }
    }

    pub fn next(&mut self) -> u32 {
        let sequence = self.next;
        self.next = self.next.wrapping_add(1);
        sequence
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
