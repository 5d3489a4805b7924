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

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use parking_lot::Mutex;
use serialport::FlowControl;
use tracing::{debug, trace, warn};
use crate::frame::{self, FrameDecoder};
use crate::link::{Callback, CallbackId, Dispatcher, Link, LinkError};
use crate::message::{Message, MessageKind};
use crate::protocol::HOST_SENDER_ID;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Serial Link
// ============================================================================

/// Link over a serial port.
///
/// A receive thread decodes frames and dispatches them to subscribers until
/// the link is dropped or the port fails.
pub struct SerialLink {
    port: Mutex<Box<dyn Write + Send>>,
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    pub fn open(port_name: &str, baud_rate: u32, flow_control: bool) -> Result<Self, LinkError> {
        let flow_control = if flow_control { FlowControl::Hardware } else { FlowControl::None };
        let port = serialport::new(port_name, baud_rate)
            .flow_control(flow_control)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader_port = port.try_clone()?;

        let link = Self::from_io(port, reader_port)?;
        debug!(port = port_name, baud_rate, "serial link open");
        Ok(link)
    }

    /// Build a link over any byte stream pair.
    ///
    /// `reader` should time out periodically so the receive thread notices
    /// when the link is dropped.
    pub fn from_io<W, R>(writer: W, reader: R) -> Result<Self, LinkError>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        let dispatcher = Arc::new(Dispatcher::new());
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let dispatcher = dispatcher.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("serial-rx".into())
                .spawn(move || receive_loop(reader, &dispatcher, &running))?
        };

        Ok(SerialLink {
            port: Mutex::new(Box::new(writer)),
            dispatcher,
            running,
            reader: Some(handle),
        })
    }
}

impl Link for SerialLink {
    fn send(&self, msg: &Message) -> Result<(), LinkError> {
        let payload = msg.encode_payload();
        let bytes = frame::encode(msg.kind().msg_type(), HOST_SENDER_ID, &payload)
            .ok_or(LinkError::PayloadTooLarge(payload.len()))?;

        if !self.running.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let mut port = self.port.lock();
        port.write_all(&bytes)?;
        port.flush()?;
        trace!(kind = ?msg.kind(), len = payload.len(), "sent");
        Ok(())
    }

    fn add_callback(&self, kinds: &[MessageKind], callback: Callback) -> CallbackId {
        self.dispatcher.add(kinds, callback)
    }

    fn remove_callback(&self, id: CallbackId) {
        self.dispatcher.remove(id);
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("serial receive thread panicked");
            }
        }
    }
}

fn receive_loop<R: Read>(mut port: R, dispatcher: &Dispatcher, running: &AtomicBool) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];

    while running.load(Ordering::Acquire) {
        let n = match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "serial read failed, stopping receive thread");
                running.store(false, Ordering::Release);
                return;
            }
        };

        for frame in decoder.push(&buf[..n]) {
            match Message::decode(frame.msg_type, &frame.payload) {
                Ok(msg) => dispatcher.dispatch(&msg),
                Err(e) => trace!(msg_type = frame.msg_type, sender = frame.sender, error = %e, "ignoring frame"),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    // Reads replay the script in order (None = timeout); an exhausted
    // script either keeps timing out or fails the port.
    struct ScriptedPort {
        reads: VecDeque<Option<Vec<u8>>>,
        fail_when_done: bool,
    }

    impl ScriptedPort {
        fn new(reads: Vec<Option<Vec<u8>>>, fail_when_done: bool) -> Self {
            ScriptedPort { reads: reads.into(), fail_when_done }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.reads.pop_front() {
                Some(Some(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(None) => Err(std::io::Error::new(ErrorKind::TimedOut, "scripted timeout")),
                None if self.fail_when_done => Err(std::io::Error::new(ErrorKind::BrokenPipe, "unplugged")),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(std::io::Error::new(ErrorKind::TimedOut, "scripted timeout"))
                }
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn framed(msg: &Message) -> Vec<u8> {
        frame::encode(msg.kind().msg_type(), 0x1234, &msg.encode_payload()).unwrap()
    }

    fn collector(dispatcher: &Dispatcher, kinds: &[MessageKind]) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.add(kinds, Box::new(move |msg: &Message| sink.lock().push(msg.clone())));
        seen
    }

    #[test]
    fn test_receive_loop_dispatches_frames() {
        let reply = Message::FileioWriteResp { sequence: 7 };
        let bytes = framed(&reply);
        let unknown = frame::encode(0x0999, 0x1234, &[1, 2, 3]).unwrap();

        let mut first = vec![0xFF, 0x00];
        first.extend_from_slice(&bytes[..4]);
        let port = ScriptedPort::new(vec![
            Some(first),
            None,
            Some(bytes[4..].to_vec()),
            Some(unknown),
            Some(framed(&Message::Reset { flags: 0 })),
        ], true);

        let dispatcher = Dispatcher::new();
        let seen = collector(&dispatcher, &[MessageKind::FileioWriteResp]);
        let running = AtomicBool::new(true);
        receive_loop(port, &dispatcher, &running);

        assert_eq!(*seen.lock(), vec![reply]);
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn test_send_writes_frame() {
        let writer = SharedWriter::default();
        let link = SerialLink::from_io(writer.clone(), ScriptedPort::new(Vec::new(), false)).unwrap();
        let msg = Message::FileioRemove { filename: "old.log".into() };

        link.send(&msg).unwrap();
        let expected = frame::encode(msg.kind().msg_type(), HOST_SENDER_ID, &msg.encode_payload()).unwrap();
        assert_eq!(*writer.0.lock(), expected);
    }

    #[test]
    fn test_send_after_port_failure_is_closed() {
        let link = SerialLink::from_io(SharedWriter::default(), ScriptedPort::new(Vec::new(), true)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let msg = Message::FileioRemove { filename: "f".into() };

        loop {
            match link.send(&msg) {
                Err(LinkError::Closed) => break,
                Ok(()) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                other => panic!("expected closed link, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let link = SerialLink::from_io(SharedWriter::default(), ScriptedPort::new(Vec::new(), false)).unwrap();
        let msg = Message::FileioReadResp { sequence: 0, contents: vec![0; 300] };
        assert!(matches!(link.send(&msg), Err(LinkError::PayloadTooLarge(304))));
    }
}
