//! Protocol engine
//!
//! The link state machine: classifies validated frames, applies the
//! sequencing and control-flow rules, drains the outstanding-message
//! queue one frame at a time, and supervises liveness with heartbeat
//! probes. [`Engine::poll`] must be called in a loop to make progress;
//! the [`Master`](crate::master::Master) facade runs that loop on a
//! background thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::LinkError;
use crate::frame::{self, ControlFrame, ReceivedFrame, I_MARK, U_MARK};
use crate::sync::Synchronizer;
use crate::transport::Transport;

/// Timing parameters governing the link
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApciParameters {
    /// Seconds an I-frame may stay unacknowledged before retransmission
    pub time_alive: f32,
    /// Seconds of inactivity before a liveness probe is sent
    pub time_heart: f32,
}

impl ApciParameters {
    pub(crate) fn alive(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f32(self.time_alive)
    }

    pub(crate) fn heart(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f32(self.time_heart)
    }
}

impl Default for ApciParameters {
    fn default() -> Self {
        Self {
            time_alive: 15.0,
            time_heart: 20.0,
        }
    }
}

/// Connection state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No traffic yet
    Idle,
    /// START confirmed, data may flow
    Active,
    /// STOP confirmed
    Stopped,
    /// Fatal error, counters cleared
    Reset,
}

/// More than this many consecutive unanswered probes kills the link
const PROBE_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgState {
    Idle,
    Sent,
}

/// An entry in the send queue
#[derive(Debug)]
struct PendingMessage {
    bytes: Vec<u8>,
    state: MsgState,
    sent_at: Option<Instant>,
}

/// Handle to the send queue, shared between application threads and the
/// engine's polling thread. The lock is held only for enqueue/dequeue/peek
/// operations, never across a transport call.
#[derive(Clone, Default)]
pub struct MessageQueue(Arc<Mutex<VecDeque<PendingMessage>>>);

impl MessageQueue {
    /// Append a prepared frame to the back of the queue
    pub fn push_frame(&self, bytes: Vec<u8>) {
        if let Ok(mut queue) = self.0.lock() {
            queue.push_back(PendingMessage {
                bytes,
                state: MsgState::Idle,
                sent_at: None,
            });
        }
    }

    /// Number of queued frames, including the one in flight
    pub fn len(&self) -> usize {
        self.0.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued frame
    pub fn clear(&self) {
        if let Ok(mut queue) = self.0.lock() {
            queue.clear();
        }
    }

    /// Number of entries currently in `Sent` state (0 or 1 by invariant)
    pub fn in_flight(&self) -> usize {
        self.0
            .lock()
            .map(|q| q.iter().filter(|m| m.state == MsgState::Sent).count())
            .unwrap_or(0)
    }
}

/// Callback for an accepted payload fragment: `(chunk, more_follows)`.
/// Returning `false` uninstalls the handler; subsequent fragments are
/// still acknowledged but no longer delivered.
pub type FragmentHandler = Box<dyn FnMut(&[u8], bool) -> bool + Send>;
/// Callback for a received or confirmed control frame
pub type ControlHandler = Box<dyn FnMut(ControlFrame) -> bool + Send>;

/// The link-layer state machine over one connection
pub struct Engine {
    sync: Synchronizer,
    params: ApciParameters,
    state: LinkState,
    send_seq: u16,
    recv_seq: u16,
    next_heartbeat: Instant,
    unconfirmed_probes: u32,
    queue: MessageQueue,
    fragment_handler: Option<FragmentHandler>,
    control_handler: Option<ControlHandler>,
}

impl Engine {
    pub fn new(transport: Box<dyn Transport>, params: ApciParameters) -> Self {
        Self::with_synchronizer(Synchronizer::new(transport), params)
    }

    pub fn with_synchronizer(sync: Synchronizer, params: ApciParameters) -> Self {
        Self {
            sync,
            state: LinkState::Idle,
            send_seq: 0,
            recv_seq: 0,
            next_heartbeat: Instant::now() + params.heart(),
            unconfirmed_probes: 0,
            queue: MessageQueue::default(),
            fragment_handler: None,
            control_handler: None,
            params,
        }
    }

    /// Handle to the send queue; clones share the same queue
    pub fn queue(&self) -> MessageQueue {
        self.queue.clone()
    }

    /// Register the handler invoked for each accepted payload fragment
    pub fn set_fragment_handler(&mut self, handler: FragmentHandler) {
        self.fragment_handler = Some(handler);
    }

    /// Register the handler invoked for connection-related control frames
    pub fn set_control_handler(&mut self, handler: ControlHandler) {
        self.control_handler = Some(handler);
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Sequence number of the last acknowledged outgoing I-frame
    pub fn send_seq(&self) -> u16 {
        self.send_seq
    }

    /// Sequence number of the last accepted incoming I-frame
    pub fn recv_seq(&self) -> u16 {
        self.recv_seq
    }

    /// Consecutive liveness probes still awaiting TEST-CONFIRM
    pub fn unconfirmed_probes(&self) -> u32 {
        self.unconfirmed_probes
    }

    /// Run one iteration of the protocol: receive and dispatch at most one
    /// frame, transmit the queue head if idle, then evaluate the heartbeat
    /// and retransmission deadlines.
    ///
    /// Recoverable conditions (framing errors, checksum mismatches) are
    /// absorbed here; an `Err` always means the link is down and all
    /// counters and the queue have been reset.
    pub fn poll(&mut self) -> Result<(), LinkError> {
        match self.sync.read_next_frame() {
            Ok(Some(buf)) => self.handle_frame(&buf)?,
            Ok(None) => {}
            Err(e) => {
                self.reset_all();
                return Err(e);
            }
        }

        // hold back new data while a probe is unanswered
        if self.unconfirmed_probes == 0 {
            self.transmit_head()?;
        }

        self.check_heartbeat()?;
        self.check_retransmit()
    }

    fn handle_frame(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        let frame = match frame::validate(buf) {
            Some(f) => f,
            None => {
                // corrupt or inconsistent; the sender's timeout recovers it
                debug!("dropping invalid frame: {:02x?}", buf);
                return Ok(());
            }
        };

        // receipt of any recognized frame is proof of liveness
        self.touch();

        match frame {
            ReceivedFrame::Information { seq, more, payload } => {
                let expected = self.recv_seq.wrapping_add(1);
                if seq != expected {
                    error!("sequence violation: expected {}, got {}", expected, seq);
                    self.reset_all();
                    return Err(LinkError::SequenceViolation {
                        expected,
                        actual: seq,
                    });
                }

                self.recv_seq = expected;
                debug!("accepted I-frame seq={} len={} more={}", seq, payload.len(), more);

                let keep = match self.fragment_handler.as_mut() {
                    Some(handler) => handler(payload, more),
                    None => true,
                };
                if !keep {
                    debug!("receive handler declined further delivery");
                    self.fragment_handler = None;
                }

                self.send_now(&frame::prepare_ack())
            }
            ReceivedFrame::Control(kind) => self.handle_control(kind),
            ReceivedFrame::Ack => {
                self.confirm_iframe();
                Ok(())
            }
        }
    }

    fn handle_control(&mut self, kind: ControlFrame) -> Result<(), LinkError> {
        debug!("received control frame {:?}", kind);
        match kind {
            ControlFrame::Start => {
                self.send_now(&frame::prepare_uframe(ControlFrame::StartConfirm))?;
                self.state = LinkState::Active;
                self.notify(kind);
            }
            ControlFrame::Reset => {
                self.send_now(&frame::prepare_uframe(ControlFrame::ResetConfirm))?;
                self.recv_seq = 0;
                self.notify(kind);
            }
            ControlFrame::Stop => {
                self.send_now(&frame::prepare_uframe(ControlFrame::StopConfirm))?;
                self.state = LinkState::Stopped;
                self.notify(kind);
            }
            ControlFrame::Test => {
                self.send_now(&frame::prepare_uframe(ControlFrame::TestConfirm))?;
            }
            ControlFrame::TestConfirm => {
                // probe answered; counter already cleared by touch()
            }
            ControlFrame::StartConfirm => {
                self.state = LinkState::Active;
                self.confirm_uframe(kind);
                self.notify(kind);
            }
            ControlFrame::ResetConfirm => {
                self.confirm_uframe(kind);
                self.notify(kind);
            }
            ControlFrame::StopConfirm => {
                self.state = LinkState::Stopped;
                self.confirm_uframe(kind);
                self.notify(kind);
            }
        }
        Ok(())
    }

    /// Dequeue the in-flight I-frame on acknowledgment
    fn confirm_iframe(&mut self) {
        if let Ok(mut queue) = self.queue.0.lock() {
            let acked = matches!(
                queue.front(),
                Some(head) if head.state == MsgState::Sent && head.bytes.first() == Some(&I_MARK)
            );
            if acked {
                queue.pop_front();
                self.send_seq = self.send_seq.wrapping_add(1);
                debug!("I-frame acknowledged, send_seq now {}", self.send_seq);
            } else {
                debug!("stray acknowledgment ignored");
            }
        }
    }

    /// Dequeue the queue head if it is the control frame this confirms
    fn confirm_uframe(&mut self, confirm: ControlFrame) {
        let Some(act) = confirm.confirms() else {
            return;
        };
        if let Ok(mut queue) = self.queue.0.lock() {
            let matches_head = matches!(
                queue.front(),
                Some(head) if head.state == MsgState::Sent
                    && head.bytes.first() == Some(&U_MARK)
                    && head.bytes.get(1) == Some(&act.code())
            );
            if matches_head {
                queue.pop_front();
            }
        }
    }

    /// Transmit the queue head if nothing is in flight. I-frames get their
    /// sequence number and checksum serialized immediately before the write.
    fn transmit_head(&mut self) -> Result<(), LinkError> {
        let outgoing = match self.queue.0.lock() {
            Ok(mut queue) => match queue.front_mut() {
                Some(head) if head.state == MsgState::Idle => {
                    if head.bytes.first() == Some(&I_MARK) {
                        frame::seal_iframe(&mut head.bytes, self.send_seq.wrapping_add(1));
                    }
                    Some(head.bytes.clone())
                }
                _ => None,
            },
            Err(_) => None,
        };

        let Some(bytes) = outgoing else {
            return Ok(());
        };

        self.send_now(&bytes)?;

        if let Ok(mut queue) = self.queue.0.lock() {
            if let Some(head) = queue.front_mut() {
                head.state = MsgState::Sent;
                head.sent_at = Some(Instant::now());
            }
        }
        Ok(())
    }

    fn check_heartbeat(&mut self) -> Result<(), LinkError> {
        if Instant::now() < self.next_heartbeat {
            return Ok(());
        }

        if self.unconfirmed_probes > PROBE_LIMIT {
            error!(
                "{} liveness probes unanswered, declaring link dead",
                self.unconfirmed_probes
            );
            self.reset_all();
            return Err(LinkError::LinkDead);
        }

        debug!("idle for {:.1}s, sending liveness probe", self.params.time_heart);
        self.send_now(&frame::prepare_uframe(ControlFrame::Test))?;
        self.unconfirmed_probes += 1;
        self.next_heartbeat = Instant::now() + self.params.heart();
        Ok(())
    }

    /// Resend the in-flight I-frame in place once `time_alive` has elapsed.
    /// A lost data frame alone never kills the link; only the probe path
    /// does.
    fn check_retransmit(&mut self) -> Result<(), LinkError> {
        let stale = match self.queue.0.lock() {
            Ok(mut queue) => match queue.front_mut() {
                Some(head)
                    if head.state == MsgState::Sent
                        && head
                            .sent_at
                            .is_some_and(|t| t.elapsed() >= self.params.alive()) =>
                {
                    head.sent_at = Some(Instant::now());
                    Some(head.bytes.clone())
                }
                _ => None,
            },
            Err(_) => None,
        };

        if let Some(bytes) = stale {
            warn!("no acknowledgment within {:.1}s, retransmitting", self.params.time_alive);
            self.send_now(&bytes)?;
        }
        Ok(())
    }

    /// Write a frame now, resetting the link on transport failure
    fn send_now(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if let Err(e) = self.sync.send_frame(bytes) {
            error!("transport write failed: {}", e);
            self.reset_all();
            return Err(e);
        }
        Ok(())
    }

    /// Receipt of a valid frame: push the heartbeat deadline out and clear
    /// the probe counter
    fn touch(&mut self) {
        self.next_heartbeat = Instant::now() + self.params.heart();
        self.unconfirmed_probes = 0;
    }

    fn reset_all(&mut self) {
        self.queue.clear();
        self.send_seq = 0;
        self.recv_seq = 0;
        self.unconfirmed_probes = 0;
        self.state = LinkState::Reset;
        self.next_heartbeat = Instant::now() + self.params.heart();
    }

    fn notify(&mut self, kind: ControlFrame) {
        if let Some(handler) = self.control_handler.as_mut() {
            handler(kind);
        }
    }
}
