//! Frame synchronization
//!
//! Finds frame boundaries in the raw byte stream and hands complete,
//! untouched frame buffers to the engine. Two timeout classes apply: an
//! idle timeout while scanning between frames, and a tighter
//! inter-character timeout once a frame has begun. A stall in the middle
//! of a frame is a framing error; an idle gap between frames is not.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use crate::error::LinkError;
use crate::frame::{
    A_MARK, I_FIXED_LEN, I_MARK, MAX_FRAGMENT_SIZE, SYNC_MARK, U_FRAME_LEN, U_MARK,
};
use crate::transport::Transport;

/// The synchronizer's two timeout classes
#[derive(Debug, Clone, Copy)]
pub struct SyncTimeouts {
    /// Idle timeout while waiting for the next frame to begin
    pub message: Duration,
    /// Inter-character timeout once inside a frame
    pub character: Duration,
}

impl Default for SyncTimeouts {
    fn default() -> Self {
        Self {
            message: Duration::from_millis(10),
            character: Duration::from_millis(300),
        }
    }
}

/// Byte-stream framer over a [`Transport`]
pub struct Synchronizer {
    transport: Box<dyn Transport>,
    timeouts: SyncTimeouts,
}

impl Synchronizer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_timeouts(transport, SyncTimeouts::default())
    }

    pub fn with_timeouts(transport: Box<dyn Transport>, timeouts: SyncTimeouts) -> Self {
        Self { transport, timeouts }
    }

    /// Prefix the frame with the synchronization byte and write it out
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.transport.is_open() {
            self.transport.open()?;
        }

        let mut buf = Vec::with_capacity(frame.len() + 1);
        buf.push(SYNC_MARK);
        buf.extend_from_slice(frame);
        self.transport.write(&buf)?;
        trace!("sent frame: {:02x?}", buf);
        Ok(())
    }

    /// Read the next complete frame from the stream.
    ///
    /// Returns `Ok(None)` when no frame arrived within the idle timeout,
    /// when a byte outside a frame was not the sync marker, or when a
    /// partial frame had to be discarded. Only a failure to open the
    /// transport is surfaced as an error.
    pub fn read_next_frame(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        if !self.transport.is_open() {
            self.transport.open()?;
        }

        self.transport.set_timeout(self.timeouts.message);
        let byte = match self.transport.read_byte() {
            Some(b) => b,
            None => return Ok(None),
        };
        if byte != SYNC_MARK {
            trace!("ignoring stray byte 0x{:02x}", byte);
            return Ok(None);
        }

        self.transport.set_timeout(self.timeouts.character);
        let mark = match self.transport.read_byte() {
            Some(b) => b,
            None => return Ok(None),
        };

        match mark {
            I_MARK => {
                let mut head = [0u8; 2];
                if !self.read_into(&mut head) {
                    self.transport.discard();
                    return Ok(None);
                }

                let payload_len = (LittleEndian::read_u16(&head) & 0x7FFF) as usize;
                if payload_len > MAX_FRAGMENT_SIZE {
                    debug!("declared payload length {} too large, resyncing", payload_len);
                    self.transport.discard();
                    return Ok(None);
                }

                // marker + length already consumed; the rest of the frame is
                // the duplicated length copy, second marker, sequence,
                // payload, checksum and end marker
                let mut frame = vec![0u8; payload_len + I_FIXED_LEN];
                frame[0] = I_MARK;
                frame[1..3].copy_from_slice(&head);
                if !self.read_into(&mut frame[3..]) {
                    debug!("mid-frame timeout, discarding partial I-frame");
                    self.transport.discard();
                    return Ok(None);
                }
                Ok(Some(frame))
            }
            U_MARK => {
                let mut frame = vec![0u8; U_FRAME_LEN];
                frame[0] = U_MARK;
                if !self.read_into(&mut frame[1..]) {
                    debug!("mid-frame timeout, discarding partial U-frame");
                    self.transport.discard();
                    return Ok(None);
                }
                Ok(Some(frame))
            }
            A_MARK => Ok(Some(vec![A_MARK])),
            other => {
                trace!("unexpected marker 0x{:02x} after sync, resyncing", other);
                self.transport.discard();
                Ok(None)
            }
        }
    }

    /// Fill `buf` byte by byte; false if the stream stalled first
    fn read_into(&mut self, buf: &mut [u8]) -> bool {
        for slot in buf.iter_mut() {
            match self.transport.read_byte() {
                Some(b) => *slot = b,
                None => return false,
            }
        }
        true
    }
}
