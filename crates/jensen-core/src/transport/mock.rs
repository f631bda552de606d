//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use super::traits::{TransportError, TransportOpener, UsbTransport};
use crate::protocol::constants::{FRAME_HEADER_LEN, FRAME_MAGIC};

/// One observed bulk operation, tagged with the sequence number decoded from
/// the bytes that crossed the pipe. Lets tests check that two logical
/// command exchanges never interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Write { command: u16, sequence: u32 },
    Read { sequence: u32 },
}

type Responder = Box<dyn FnMut(u16, u32, &[u8]) -> Vec<Vec<u8>> + Send>;

/// Scriptable transport for unit tests.
///
/// Reads are served from a queue; a responder hook can answer each written
/// frame automatically (optionally split across several chunks to simulate
/// short bulk reads).
pub struct MockTransport {
    reads: Arc<Mutex<VecDeque<Vec<u8>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    ops: Arc<Mutex<Vec<MockOp>>>,
    responder: Option<Responder>,
    connected: Arc<AtomicBool>,
    /// Commands answered with an endpoint stall instead of a reply.
    stall_on: Option<u16>,
    /// Artificial latency per write, to widen race windows in concurrency
    /// tests.
    write_delay: Option<Duration>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            reads: Arc::new(Mutex::new(VecDeque::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            ops: Arc::new(Mutex::new(Vec::new())),
            responder: None,
            connected: Arc::new(AtomicBool::new(true)),
            stall_on: None,
            write_delay: None,
            vid,
            pid,
        }
    }

    /// Queue raw bytes to be returned by the next read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.reads.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Install a hook that builds the read chunks answering each written
    /// frame. Called with the decoded command id, sequence, and body.
    pub fn set_responder<F>(&mut self, responder: F)
    where
        F: FnMut(u16, u32, &[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
    }

    pub fn set_stall_on(&mut self, command: u16) {
        self.stall_on = Some(command);
    }

    pub fn set_write_delay(&mut self, delay: Duration) {
        self.write_delay = Some(delay);
    }

    /// All captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Handle to the shared operation log, usable after the transport is
    /// boxed into a session.
    pub fn ops_handle(&self) -> Arc<Mutex<Vec<MockOp>>> {
        Arc::clone(&self.ops)
    }

    /// Simulate device unplug.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn decode_header(bytes: &[u8]) -> Option<(u16, u32)> {
        if bytes.len() >= FRAME_HEADER_LEN && bytes[0..2] == FRAME_MAGIC {
            Some((
                BigEndian::read_u16(&bytes[2..4]),
                BigEndian::read_u32(&bytes[4..8]),
            ))
        } else {
            None
        }
    }
}

impl UsbTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        let (command, sequence) = Self::decode_header(data).unwrap_or((0, 0));
        self.ops
            .lock()
            .unwrap()
            .push(MockOp::Write { command, sequence });
        self.writes.lock().unwrap().push(data.to_vec());

        if self.stall_on == Some(command) {
            return Err(TransportError::Stall);
        }
        if let Some(responder) = self.responder.as_mut() {
            let body = &data[FRAME_HEADER_LEN.min(data.len())..];
            for chunk in responder(command, sequence, body) {
                self.reads.lock().unwrap().push_back(chunk);
            }
        }
        Ok(data.len())
    }

    fn read(&mut self, _max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let popped = self.reads.lock().unwrap().pop_front();
        let chunk = match popped {
            Some(chunk) => chunk,
            None => {
                // A silent device: the bounded read blocks until the
                // timeout elapses.
                std::thread::sleep(timeout);
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        let sequence = Self::decode_header(&chunk).map(|(_, s)| s).unwrap_or(0);
        self.ops.lock().unwrap().push(MockOp::Read { sequence });
        Ok(chunk)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Opener over a fixed set of attached mock devices. Each open consumes the
/// transport prepared for that id pair.
pub struct MockOpener {
    transports: Mutex<Vec<(u16, u16, MockTransport)>>,
}

impl MockOpener {
    pub fn new(transports: Vec<(u16, u16, MockTransport)>) -> Self {
        Self {
            transports: Mutex::new(transports),
        }
    }
}

impl TransportOpener for MockOpener {
    fn open(&self, vid: u16, pid: u16) -> Result<Box<dyn UsbTransport>, TransportError> {
        let mut transports = self.transports.lock().unwrap();
        match transports.iter().position(|(v, p, _)| *v == vid && *p == pid) {
            Some(idx) => {
                let (_, _, transport) = transports.remove(idx);
                Ok(Box::new(transport))
            }
            None => Err(TransportError::DeviceNotFound { vid, pid }),
        }
    }

    fn list_attached(&self) -> Result<Vec<(u16, u16)>, TransportError> {
        Ok(self
            .transports
            .lock()
            .unwrap()
            .iter()
            .map(|(v, p, _)| (*v, *p))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::CommandFrame;

    #[test]
    fn write_capture_and_queued_reads() {
        let mut mock = MockTransport::new(0x3887, 0xAF0D);
        mock.queue_read(b"abc");

        mock.write(&CommandFrame::new(1, 9, vec![]).encode()).unwrap();
        assert_eq!(mock.read(512, Duration::from_millis(5)).unwrap(), b"abc");

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            mock.ops_handle().lock().unwrap()[0],
            MockOp::Write {
                command: 1,
                sequence: 9
            }
        );
    }

    #[test]
    fn empty_queue_reads_time_out() {
        let mut mock = MockTransport::new(0x3887, 0xAF0D);
        assert!(matches!(
            mock.read(512, Duration::from_millis(5)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn disconnect_fails_io() {
        let mut mock = MockTransport::new(0x3887, 0xAF0D);
        assert!(mock.is_connected());
        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.write(b"x"),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn responder_answers_each_frame() {
        let mut mock = MockTransport::new(0x3887, 0xAF0D);
        mock.set_responder(|command, sequence, _body| {
            vec![CommandFrame::new(command, sequence, vec![0x55]).encode()]
        });
        mock.write(&CommandFrame::new(6, 3, vec![]).encode()).unwrap();
        let reply = mock.read(512, Duration::from_millis(5)).unwrap();
        assert_eq!(reply[2..4], [0, 6]);
        assert_eq!(reply[4..8], [0, 0, 0, 3]);
    }
}
