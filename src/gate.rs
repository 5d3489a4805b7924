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
use parking_lot::{Condvar, Mutex};
use tracing::warn;

struct GateState {
    available: usize,
    closed: bool,
}

/// Counting permit set bounding how many requests may be in flight.
///
/// Waiting is done on condition variables, never by polling.
pub struct Gate {
    capacity: usize,
    state: Mutex<GateState>,
    permit_freed: Condvar,
    idle: Condvar,
}

impl Gate {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Gate {
            capacity,
            state: Mutex::new(GateState { available: capacity, closed: false }),
            permit_freed: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.state.lock().available
    }

    /// Wait up to `timeout` for a permit. Returns false on timeout or once closed.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        self.permit_freed.wait_while_for(&mut state, |s| s.available == 0 && !s.closed, timeout);
        take_permit(&mut state)
    }

    pub fn try_acquire(&self) -> bool {
        take_permit(&mut self.state.lock())
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.available == self.capacity {
            warn!("permit released with none outstanding");
            return;
        }
        state.available += 1;
        if state.available == self.capacity {
            self.idle.notify_all();
        }
        self.permit_freed.notify_one();
    }

    /// Wait up to `timeout` for every permit to be returned
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        self.idle.wait_while_for(&mut state, |s| s.available < self.capacity && !s.closed, timeout);
        state.available == self.capacity
    }

    /// Wake all waiters and refuse further permits
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.permit_freed.notify_all();
        self.idle.notify_all();
    }
}

fn take_permit(state: &mut GateState) -> bool {
    if state.closed || state.available == 0 {
        return false;
    }
    state.available -= 1;
    true
}
