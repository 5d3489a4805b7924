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

use std::sync::atomic::{AtomicU64, Ordering};
use crossbeam::channel::{self, Receiver, TrySendError};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{trace, warn};
use crate::message::{Message, MessageKind};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
    #[error("link closed")]
    Closed,
}

// ============================================================================
// Link Trait
// ============================================================================

pub type Callback = Box<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Best effort message transport.
///
/// `send` hands one message to the wire and returns without waiting for any
/// reply. Callbacks run on whatever thread the link receives on.
pub trait Link: Send + Sync {
    fn send(&self, msg: &Message) -> Result<(), LinkError>;

    fn add_callback(&self, kinds: &[MessageKind], callback: Callback) -> CallbackId;

    /// Once this returns the callback will not be invoked again.
    fn remove_callback(&self, id: CallbackId);
}

/// Registration that removes its callback when dropped
pub struct Subscription<'a, L: Link + ?Sized> {
    link: &'a L,
    id: CallbackId,
}

impl<L: Link + ?Sized> Drop for Subscription<'_, L> {
    fn drop(&mut self) {
        self.link.remove_callback(self.id);
    }
}

pub fn subscribe<'a, L: Link + ?Sized>(
    link: &'a L,
    kinds: &[MessageKind],
    callback: Callback,
) -> Subscription<'a, L> {
    let id = link.add_callback(kinds, callback);
    Subscription { link, id }
}

/// Deliver messages of the given kinds into a bounded channel.
///
/// A full channel drops the message, which the caller sees as link loss.
pub fn subscribe_channel<'a, L: Link + ?Sized>(
    link: &'a L,
    kinds: &[MessageKind],
    depth: usize,
) -> (Subscription<'a, L>, Receiver<Message>) {
    let (tx, rx) = channel::bounded(depth);
    let subscription = subscribe(link, kinds, Box::new(move |msg: &Message| {
        match tx.try_send(msg.clone()) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(msg)) => warn!(kind = ?msg.kind(), "receive queue full, dropping message"),
        }
    }));
    (subscription, rx)
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Registration {
    id: CallbackId,
    kinds: Vec<MessageKind>,
    callback: Callback,
}

/// Callback registry shared by link implementations
#[derive(Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kinds: &[MessageKind], callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.write().push(Registration { id, kinds: kinds.to_vec(), callback });
        id
    }

    /// Takes the write lock, so a dispatch already running finishes first.
    pub fn remove(&self, id: CallbackId) {
        self.registrations.write().retain(|r| r.id != id);
    }

    pub fn dispatch(&self, msg: &Message) {
        let kind = msg.kind();
        let registrations = self.registrations.read();
        let mut delivered = false;
        for registration in registrations.iter().filter(|r| r.kinds.contains(&kind)) {
            (registration.callback)(msg);
            delivered = true;
        }
        if !delivered {
            trace!(?kind, "no subscriber for message");
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Mock Link for Testing
// ============================================================================

#[cfg(test)]
pub type Responder = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

/// Records every sent message and answers through a scripted responder.
///
/// Replies are dispatched on the sending thread before `send` returns.
#[cfg(test)]
pub struct MockLink {
    pub dispatcher: Dispatcher,
    sent: parking_lot::Mutex<Vec<Message>>,
    responder: parking_lot::Mutex<Responder>,
}

#[cfg(test)]
impl MockLink {
    pub fn new(responder: impl FnMut(&Message) -> Vec<Message> + Send + 'static) -> Self {
        MockLink {
            dispatcher: Dispatcher::new(),
            sent: parking_lot::Mutex::new(Vec::new()),
            responder: parking_lot::Mutex::new(Box::new(responder)),
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Deliver a message as though the device had sent it
    pub fn inject(&self, msg: &Message) {
        self.dispatcher.dispatch(msg);
    }
}

#[cfg(test)]
impl Link for MockLink {
    fn send(&self, msg: &Message) -> Result<(), LinkError> {
        self.sent.lock().push(msg.clone());
        let replies = {
            let mut responder = self.responder.lock();
            (*responder)(msg)
        };
        for reply in &replies {
            self.dispatcher.dispatch(reply);
        }
        Ok(())
    }

    fn add_callback(&self, kinds: &[MessageKind], callback: Callback) -> CallbackId {
        self.dispatcher.add(kinds, callback)
    }

    fn remove_callback(&self, id: CallbackId) {
        self.dispatcher.remove(id);
    }
}

// ============================================================================
// Tests
// ============================================================================
