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

//! Selective repeat over a best effort link.
//!
//! The caller thread admits requests through a [`Gate`] and transmits them.
//! A reactor thread, scoped to one operation, owns the window of pending
//! requests. It receives replies from the link callback over a channel,
//! hands matches to `on_reply`, returns permits and retransmits requests
//! whose reply is overdue. A request that stays unanswered after
//! `max_retries` resends fails the whole operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};
use crate::config::TransferConfig;
use crate::gate::Gate;
use crate::link::{self, Link, LinkError};
use crate::message::{Message, MessageKind};

const EVENT_QUEUE_DEPTH: usize = 1024;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request {sequence} at offset {offset} unacknowledged after {attempts} attempts")]
    Timeout { sequence: u32, offset: u32, attempts: u16 },
    #[error("{0:?} carries no sequence number")]
    Unsequenced(MessageKind),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("reply handling stopped unexpectedly")]
    ReactorStopped,
    #[error(transparent)]
    Link(#[from] LinkError),
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared flag checked by windowed transfers at every wait
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Window
// ============================================================================

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub sequence: u32,
    pub message: Message,
    pub sent_at: Instant,
    pub attempts: u8,
}

/// How a reply relates to the requests of the current operation
#[derive(Debug)]
pub enum ReplyMatch {
    /// Answers a pending request, which is removed from the window
    Matched(PendingRequest),
    /// Answers a request that was already matched, typically after a resend
    Stale(u32),
    /// Answers nothing issued by this operation
    Unknown(Option<u32>),
}

#[derive(Debug, Default)]
pub struct Window {
    pending: HashMap<u32, PendingRequest>,
    completed: HashSet<u32>,
}

impl Window {
    pub fn insert(&mut self, request: PendingRequest) {
        self.pending.insert(request.sequence, request);
    }

    pub fn resolve(&mut self, reply: &Message) -> ReplyMatch {
        let Some(sequence) = reply.sequence() else {
            return ReplyMatch::Unknown(None);
        };
        match self.pending.remove(&sequence) {
            Some(request) => {
                self.completed.insert(sequence);
                ReplyMatch::Matched(request)
            }
            None if self.completed.contains(&sequence) => ReplyMatch::Stale(sequence),
            None => ReplyMatch::Unknown(Some(sequence)),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// When the oldest pending request becomes overdue
    pub fn next_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.pending.values().map(|p| p.sent_at + timeout).min()
    }

    pub fn expired_mut(&mut self, now: Instant, timeout: Duration) -> impl Iterator<Item = &mut PendingRequest> {
        self.pending.values_mut().filter(move |p| now.duration_since(p.sent_at) >= timeout)
    }
}

// ============================================================================
// Reactor
// ============================================================================

enum Event {
    Submitted(PendingRequest),
    Reply(Message),
    Shutdown,
}

struct Reactor<'r, L: Link + ?Sized> {
    link: &'r L,
    gate: &'r Gate,
    failure: &'r Mutex<Option<TransferError>>,
    config: &'r TransferConfig,
    window: Window,
}

impl<L: Link + ?Sized> Reactor<'_, L> {
    fn run<F>(mut self, events: Receiver<Event>, mut on_reply: F)
    where
        F: FnMut(&Message, &Message),
    {
        loop {
            let event = match self.window.next_deadline(self.config.timeout) {
                Some(deadline) => events.recv_deadline(deadline),
                None => events.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match event {
                Ok(Event::Submitted(request)) => {
                    self.window.insert(request);
                    debug_assert!(self.window.len() <= self.gate.capacity());
                }
                Ok(Event::Reply(reply)) => match self.window.resolve(&reply) {
                    ReplyMatch::Matched(request) => {
                        on_reply(&request.message, &reply);
                        self.gate.release();
                    }
                    ReplyMatch::Stale(sequence) => trace!(sequence, "duplicate reply"),
                    ReplyMatch::Unknown(sequence) => trace!(?sequence, "reply matches no request"),
                },
                Ok(Event::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.retransmit_expired();
        }
    }

    fn retransmit_expired(&mut self) {
        let now = Instant::now();
        let mut failure = None;

        for request in self.window.expired_mut(now, self.config.timeout) {
            if request.attempts >= self.config.max_retries {
                let offset = request.message.offset().unwrap_or(0);
                warn!(sequence = request.sequence, offset, attempts = request.attempts, "request timed out");
                failure = Some(TransferError::Timeout {
                    sequence: request.sequence,
                    offset,
                    attempts: u16::from(request.attempts) + 1,
                });
                break;
            }

            request.attempts += 1;
            request.sent_at = now;
            debug!(sequence = request.sequence, attempt = request.attempts, "retransmitting");
            if let Err(e) = self.link.send(&request.message) {
                failure = Some(e.into());
                break;
            }
        }

        if let Some(e) = failure {
            self.fail(e);
        }
    }

    fn fail(&mut self, error: TransferError) {
        self.failure.lock().get_or_insert(error);
        self.window.clear();
        self.gate.close();
    }
}

// Waiters must never outlive the reactor, however it exits.
impl<L: Link + ?Sized> Drop for Reactor<'_, L> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.failure.lock().get_or_insert(TransferError::ReactorStopped);
        }
        self.gate.close();
    }
}

// ============================================================================
// Selective Repeater
// ============================================================================

/// Caller side of one windowed operation, see [`SelectiveRepeater::run`]
pub struct SelectiveRepeater<'r, L: Link + ?Sized> {
    link: &'r L,
    gate: &'r Gate,
    failure: &'r Mutex<Option<TransferError>>,
    config: &'r TransferConfig,
    cancel: Option<&'r CancelToken>,
    events: Sender<Event>,
}

impl<'r, L: Link + ?Sized> SelectiveRepeater<'r, L> {
    /// Run `body` with a repeater bound to replies of `reply_kind`.
    ///
    /// The reply callback is registered for exactly the duration of this
    /// call. `on_reply(request, reply)` runs on the reactor thread once per
    /// matched request.
    pub fn run<T, F, B>(
        link: &L,
        config: &TransferConfig,
        cancel: Option<&CancelToken>,
        reply_kind: MessageKind,
        on_reply: F,
        body: B,
    ) -> Result<T, TransferError>
    where
        F: FnMut(&Message, &Message) + Send,
        B: FnOnce(&SelectiveRepeater<'_, L>) -> Result<T, TransferError>,
    {
        let gate = Gate::new(config.window);
        let failure = Mutex::new(None);
        let (events, inbox) = channel::bounded(EVENT_QUEUE_DEPTH);

        let replies = events.clone();
        let _subscription = link::subscribe(link, &[reply_kind], Box::new(move |msg: &Message| {
            if let Err(TrySendError::Full(_)) = replies.try_send(Event::Reply(msg.clone())) {
                warn!(kind = ?msg.kind(), "reply queue full, dropping reply");
            }
        }));

        std::thread::scope(|scope| {
            let reactor = Reactor {
                link,
                gate: &gate,
                failure: &failure,
                config,
                window: Window::default(),
            };
            let handle = scope.spawn(move || reactor.run(inbox, on_reply));

            let repeater = SelectiveRepeater {
                link,
                gate: &gate,
                failure: &failure,
                config,
                cancel,
                events,
            };
            let result = body(&repeater);
            drop(repeater);

            if handle.join().is_err() {
                failure.lock().get_or_insert(TransferError::ReactorStopped);
            }
            let value = result?;
            match failure.lock().take() {
                Some(e) => Err(e),
                None => Ok(value),
            }
        })
    }

    /// Transmit a sequenced request once a window slot is free.
    ///
    /// Returns without waiting for the reply.
    pub fn send(&self, message: Message) -> Result<(), TransferError> {
        self.send_with(|| Some(message)).map(|_| ())
    }

    /// Wait for a window slot, then build and transmit a request.
    ///
    /// `build` runs only once the slot is held, so it sees every reply that
    /// freed one. Returning `None` gives the slot back and sends nothing.
    pub fn send_with<F>(&self, build: F) -> Result<bool, TransferError>
    where
        F: FnOnce() -> Option<Message>,
    {
        loop {
            self.check()?;
            if self.gate.acquire(self.config.timeout) {
                break;
            }
        }

        let Some(message) = build() else {
            self.gate.release();
            return Ok(false);
        };
        let Some(sequence) = message.sequence() else {
            self.gate.release();
            return Err(TransferError::Unsequenced(message.kind()));
        };

        let request = PendingRequest {
            sequence,
            message: message.clone(),
            sent_at: Instant::now(),
            attempts: 0,
        };
        self.events.send(Event::Submitted(request)).map_err(|_| LinkError::Closed)?;
        self.link.send(&message)?;
        Ok(true)
    }

    /// Block until every request sent so far has been answered
    pub fn flush(&self) -> Result<(), TransferError> {
        loop {
            self.check()?;
            if self.gate.wait_idle(self.config.timeout) {
                return Ok(());
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.gate.in_use()
    }

    fn check(&self) -> Result<(), TransferError> {
        if let Some(e) = self.failure.lock().take() {
            return Err(e);
        }
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }
}

impl<L: Link + ?Sized> Drop for SelectiveRepeater<'_, L> {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use crate::link::MockLink;

    fn fast_config(window: usize) -> TransferConfig {
        TransferConfig {
            window,
            timeout: Duration::from_millis(100),
            ..TransferConfig::default()
        }
    }

    fn write_req(sequence: u32) -> Message {
        Message::FileioWriteReq {
            sequence,
            offset: sequence * 4,
            filename: "f".into(),
            data: vec![0; 4],
        }
    }

    fn ack(msg: &Message) -> Vec<Message> {
        match msg {
            Message::FileioWriteReq { sequence, .. } => vec![Message::FileioWriteResp { sequence: *sequence }],
            _ => vec![],
        }
    }

    fn send_all(link: &MockLink, config: &TransferConfig, count: u32) -> (Result<(), TransferError>, usize) {
        let mut replies = 0;
        let result = SelectiveRepeater::run(
            link,
            config,
            None,
            MessageKind::FileioWriteResp,
            |_, _| replies += 1,
            |repeater| {
                for sequence in 0..count {
                    repeater.send(write_req(sequence))?;
                }
                repeater.flush()?;
                assert_eq!(repeater.in_flight(), 0);
                Ok(())
            },
        );
        (result, replies)
    }

    #[test]
    fn test_window_resolve() {
        let mut window = Window::default();
        window.insert(PendingRequest { sequence: 5, message: write_req(5), sent_at: Instant::now(), attempts: 0 });

        assert!(matches!(window.resolve(&Message::FileioWriteResp { sequence: 5 }), ReplyMatch::Matched(r) if r.sequence == 5));
        assert!(matches!(window.resolve(&Message::FileioWriteResp { sequence: 5 }), ReplyMatch::Stale(5)));
        assert!(matches!(window.resolve(&Message::FileioWriteResp { sequence: 6 }), ReplyMatch::Unknown(Some(6))));
        assert!(matches!(window.resolve(&Message::Reset { flags: 0 }), ReplyMatch::Unknown(None)));
        assert!(window.is_empty());
    }

    #[test]
    fn test_all_requests_acknowledged() {
        let link = MockLink::new(ack);
        let (result, replies) = send_all(&link, &fast_config(3), 10);
        result.unwrap();
        assert_eq!(replies, 10);
        assert_eq!(link.sent().len(), 10);
    }

    #[test]
    fn test_duplicate_replies_tolerated() {
        let link = MockLink::new(|msg| {
            let mut replies = ack(msg);
            replies.extend(ack(msg));
            replies
        });
        let (result, replies) = send_all(&link, &fast_config(2), 6);
        result.unwrap();
        assert_eq!(replies, 6);
    }

    #[test]
    fn test_lost_reply_retransmitted() {
        let mut dropped = false;
        let link = MockLink::new(move |msg| {
            if msg.sequence() == Some(2) && !dropped {
                dropped = true;
                return vec![];
            }
            ack(msg)
        });
        let (result, replies) = send_all(&link, &fast_config(4), 5);
        result.unwrap();
        assert_eq!(replies, 5);

        let sent = link.sent();
        assert_eq!(sent.len(), 6);
        assert_eq!(sent.iter().filter(|m| m.sequence() == Some(2)).count(), 2);
    }

    #[test]
    fn test_retry_bound() {
        let link = MockLink::silent();
        let (result, replies) = send_all(&link, &fast_config(1), 1);
        match result {
            Err(TransferError::Timeout { sequence: 0, offset: 0, attempts: 4 }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(replies, 0);
        assert_eq!(link.sent(), vec![write_req(0); 4]);
    }

    #[test]
    fn test_widest_retry_budget_reports_every_attempt() {
        let link = MockLink::silent();
        let config = TransferConfig {
            window: 1,
            timeout: Duration::from_millis(1),
            max_retries: u8::MAX,
            ..TransferConfig::default()
        };
        let (result, _) = send_all(&link, &config, 1);
        match result {
            Err(TransferError::Timeout { sequence: 0, attempts: 256, .. }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(link.sent().len(), 256);
    }

    #[test]
    fn test_panicking_reply_handler_fails_transfer() {
        let link = MockLink::new(ack);
        let result = SelectiveRepeater::run(
            &link,
            &fast_config(2),
            None,
            MessageKind::FileioWriteResp,
            |_, _| panic!("reply handler bug"),
            |repeater| {
                repeater.send(write_req(0))?;
                repeater.flush()
            },
        );
        assert!(matches!(result, Err(TransferError::ReactorStopped)));
        assert!(link.dispatcher.is_empty());
    }

    #[test]
    fn test_window_bound() {
        const WINDOW: usize = 3;
        let max_outstanding = std::sync::Arc::new(Mutex::new(0usize));
        let observed = max_outstanding.clone();
        let mut outstanding: Vec<Message> = Vec::new();

        // Hold replies until the window fills or a resend shows the sender is stuck
        let link = MockLink::new(move |msg| {
            let resend = outstanding.contains(msg);
            if !resend {
                outstanding.push(msg.clone());
            }
            let mut max = observed.lock();
            *max = (*max).max(outstanding.len());
            if resend || outstanding.len() == WINDOW {
                outstanding.drain(..).flat_map(|m| ack(&m)).collect()
            } else {
                vec![]
            }
        });

        let (result, replies) = send_all(&link, &fast_config(WINDOW), 8);
        result.unwrap();
        assert_eq!(replies, 8);
        assert_eq!(*max_outstanding.lock(), WINDOW);

        let sequences: HashSet<_> = link.sent().iter().filter_map(Message::sequence).collect();
        assert_eq!(sequences.len(), 8);
    }

    #[test]
    fn test_cancelled_before_send() {
        let link = MockLink::new(ack);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = SelectiveRepeater::run(
            &link,
            &fast_config(2),
            Some(&cancel),
            MessageKind::FileioWriteResp,
            |_, _| {},
            |repeater| repeater.send(write_req(0)),
        );
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_unsequenced_rejected() {
        let link = MockLink::silent();
        let result = SelectiveRepeater::run(
            &link,
            &fast_config(2),
            None,
            MessageKind::FileioWriteResp,
            |_, _| {},
            |repeater| repeater.send(Message::FileioRemove { filename: "f".into() }),
        );
        assert!(matches!(result, Err(TransferError::Unsequenced(MessageKind::FileioRemove))));
    }

    #[test]
    fn test_declined_send_returns_permit() {
        let link = MockLink::silent();
        let result = SelectiveRepeater::run(
            &link,
            &fast_config(1),
            None,
            MessageKind::FileioWriteResp,
            |_, _| {},
            |repeater| {
                let sent = repeater.send_with(|| None)?;
                Ok((sent, repeater.in_flight()))
            },
        );
        assert_eq!(result.unwrap(), (false, 0));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_callback_removed_after_run() {
        let link = MockLink::new(ack);
        send_all(&link, &fast_config(2), 2).0.unwrap();
        assert!(link.dispatcher.is_empty());
    }
}
