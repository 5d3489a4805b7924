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

//! Simulated receiver used by the integration tests.
//!
//! Keeps files in memory, answers file and bootloader requests, and can drop,
//! duplicate and reorder its replies.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sbp_fileio::link::{Callback, CallbackId, Dispatcher};
use sbp_fileio::{Link, LinkError, Message, MessageKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub reorder: bool,
}

/// Which handshake the simulated bootloader sends after a reset
#[derive(Debug, Clone)]
pub enum Dialect {
    Legacy(Vec<u8>),
    Versioned { major: u8, minor: u8, version: String },
}

struct DeviceState {
    files: BTreeMap<String, Vec<u8>>,
    faults: Faults,
    rng: StdRng,
    held: Vec<Message>,
    window_size: Option<u32>,
    dialect: Option<Dialect>,
    received: Vec<Message>,
}

pub struct SimDevice {
    dispatcher: Arc<Dispatcher>,
    state: Mutex<DeviceState>,
    delivery: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::with_faults(Faults::default(), 0)
    }

    pub fn with_faults(faults: Faults, seed: u64) -> Self {
        SimDevice {
            dispatcher: Arc::new(Dispatcher::new()),
            state: Mutex::new(DeviceState {
                files: BTreeMap::new(),
                faults,
                rng: StdRng::seed_from_u64(seed),
                held: Vec::new(),
                window_size: None,
                dialect: None,
                received: Vec::new(),
            }),
            delivery: None,
            worker: None,
        }
    }

    /// Deliver replies from a separate thread, like a real receive loop
    pub fn threaded(mut self) -> Self {
        let (tx, rx) = channel::unbounded::<Message>();
        let dispatcher = self.dispatcher.clone();
        self.worker = Some(std::thread::spawn(move || {
            for msg in rx {
                dispatcher.dispatch(&msg);
            }
        }));
        self.delivery = Some(tx);
        self
    }

    pub fn with_window(self, window_size: u32) -> Self {
        self.state.lock().window_size = Some(window_size);
        self
    }

    pub fn with_dialect(self, dialect: Dialect) -> Self {
        self.state.lock().dialect = Some(dialect);
        self
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.state.lock().files.insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn received(&self) -> Vec<Message> {
        self.state.lock().received.clone()
    }

    pub fn subscribers(&self) -> usize {
        self.dispatcher.len()
    }
}

impl DeviceState {
    fn handle(&mut self, msg: &Message) -> Option<Message> {
        match msg {
            Message::FileioReadReq { sequence, offset, chunk_size, filename } => {
                let file = self.files.get(filename).map(Vec::as_slice).unwrap_or(&[]);
                let start = (*offset as usize).min(file.len());
                let end = (start + *chunk_size as usize).min(file.len());
                Some(Message::FileioReadResp { sequence: *sequence, contents: file[start..end].to_vec() })
            }
            Message::FileioWriteReq { sequence, offset, filename, data } => {
                let file = self.files.entry(filename.clone()).or_default();
                let start = *offset as usize;
                if file.len() < start + data.len() {
                    file.resize(start + data.len(), 0);
                }
                file[start..start + data.len()].copy_from_slice(data);
                Some(Message::FileioWriteResp { sequence: *sequence })
            }
            Message::FileioRemove { filename } => {
                self.files.remove(filename);
                None
            }
            Message::FileioReadDirReq { sequence, offset, dirname } => {
                let prefix = if dirname == "." || dirname.is_empty() { String::new() } else { format!("{}/", dirname.trim_end_matches('/')) };
                let mut contents = Vec::new();
                let names = self.files.keys()
                    .filter_map(|path| path.strip_prefix(&prefix))
                    .filter(|leaf| !leaf.contains('/'))
                    .skip(*offset as usize);
                for name in names {
                    if contents.len() + name.len() + 1 > 251 {
                        break;
                    }
                    contents.extend_from_slice(name.as_bytes());
                    contents.push(0);
                }
                Some(Message::FileioReadDirResp { sequence: *sequence, contents })
            }
            Message::FileioConfigReq { sequence } => self.window_size.map(|window_size| Message::FileioConfigResp {
                sequence: *sequence,
                window_size,
                batch_size: 1,
                fileio_version: 1,
            }),
            Message::Reset { .. } => self.dialect.as_ref().map(|dialect| match dialect {
                Dialect::Legacy(payload) => Message::BootloaderHandshakeDeprecated { payload: payload.clone() },
                Dialect::Versioned { major, minor, version } => Message::BootloaderHandshakeResp {
                    flags: ((*major as u32) << 8) | *minor as u32,
                    version: version.clone(),
                },
            }),
            _ => None,
        }
    }

    fn apply_faults(&mut self, reply: Option<Message>) -> Vec<Message> {
        if let Some(reply) = reply {
            if !self.rng.random_bool(self.faults.drop_rate) {
                if self.rng.random_bool(self.faults.duplicate_rate) {
                    self.held.push(reply.clone());
                }
                self.held.push(reply);
            }
        }

        if self.faults.reorder {
            if self.held.len() < 3 && !self.rng.random_bool(0.3) {
                return Vec::new();
            }
            self.held.shuffle(&mut self.rng);
        }
        self.held.drain(..).collect()
    }
}

impl Link for SimDevice {
    fn send(&self, msg: &Message) -> Result<(), LinkError> {
        let replies = {
            let mut state = self.state.lock();
            state.received.push(msg.clone());
            let reply = state.handle(msg);
            state.apply_faults(reply)
        };
        for reply in replies {
            match &self.delivery {
                Some(tx) => tx.send(reply).map_err(|_| LinkError::Closed)?,
                None => self.dispatcher.dispatch(&reply),
            }
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

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.delivery.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
