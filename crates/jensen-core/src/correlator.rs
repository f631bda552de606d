//! Request/response correlation.
//!
//! Sequence numbers are unique and increasing for the lifetime of a session.
//! A pending request is resolved by exactly one matching response frame or
//! by its timeout, never both: once a request times out its table entry is
//! removed, and a frame for it arriving later is discarded with a warning
//! rather than an error. The correlator never retries; retry and recovery
//! policy lives in the session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{JensenError, Result};
use crate::protocol::constants::BULK_READ_LEN;
use crate::protocol::frame::{CommandFrame, FrameDecoder, ResponseFrame};
use crate::transport::{TransportError, UsbTransport};

/// An in-flight call awaiting its reply.
#[derive(Debug, Clone, Copy)]
pub struct PendingRequest {
    pub command: u16,
    pub issued_at: Instant,
    pub timeout: Duration,
}

/// Owns the sequence counter, the frame decoder, and the pending table.
#[derive(Debug)]
pub struct Correlator {
    next_sequence: u32,
    decoder: FrameDecoder,
    pending: HashMap<u32, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            decoder: FrameDecoder::new(),
            pending: HashMap::new(),
        }
    }

    /// Encode and write a request, recording it as pending. Returns the
    /// allocated sequence number.
    pub fn send(
        &mut self,
        transport: &mut dyn UsbTransport,
        command: u16,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<u32> {
        let sequence = self.next_sequence;
        // Wraps after 2^32 exchanges; by then all earlier sequences are
        // long resolved.
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending.insert(
            sequence,
            PendingRequest {
                command,
                issued_at: Instant::now(),
                timeout,
            },
        );
        let frame = CommandFrame::new(command, sequence, body);
        transport.write(&frame.encode())?;
        Ok(sequence)
    }

    /// Block until the frame resolving `sequence` arrives, or its timeout
    /// elapses. On timeout the pending entry is removed and the timeout
    /// error surfaces to the caller.
    pub fn receive(&mut self, transport: &mut dyn UsbTransport, sequence: u32) -> Result<ResponseFrame> {
        let pending = self
            .pending
            .get(&sequence)
            .copied()
            .ok_or_else(|| JensenError::Protocol(format!("sequence {sequence} is not pending")))?;
        let deadline = pending.issued_at + pending.timeout;

        let result = self.wait_for(transport, sequence, deadline, pending.command, pending.timeout);
        // Resolved or timed out, either way the entry is gone.
        self.pending.remove(&sequence);
        result
    }

    /// Wait for a continuation frame of a streaming reply. The pending entry
    /// was already resolved by the first frame; continuations repeat the
    /// request's sequence.
    pub fn receive_more(
        &mut self,
        transport: &mut dyn UsbTransport,
        sequence: u32,
        command: u16,
        timeout: Duration,
    ) -> Result<ResponseFrame> {
        self.wait_for(transport, sequence, Instant::now() + timeout, command, timeout)
    }

    fn wait_for(
        &mut self,
        transport: &mut dyn UsbTransport,
        sequence: u32,
        deadline: Instant,
        command: u16,
        timeout: Duration,
    ) -> Result<ResponseFrame> {
        loop {
            while let Some(frame) = self.decoder.next_frame()? {
                if frame.sequence == sequence {
                    return Ok(frame);
                }
                // Spurious or late duplicate: not an error.
                warn!(
                    sequence = frame.sequence,
                    command = frame.command,
                    "Discarding unmatched response frame"
                );
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(JensenError::Timeout {
                    command,
                    millis: timeout.as_millis() as u64,
                });
            }

            // The bounded read blocks for at most the remaining deadline,
            // so a device that sends nothing cannot hang the caller.
            match transport.read(BULK_READ_LEN, deadline - now) {
                Ok(bytes) if bytes.is_empty() => continue,
                Ok(bytes) => self.decoder.extend(&bytes),
                // Expired read; the deadline check above decides next pass.
                Err(TransportError::Timeout { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop buffered bytes and forget all pending requests. The sequence
    /// counter keeps increasing across resets.
    pub fn reset(&mut self) {
        self.decoder.clear();
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
