//! Link master
//!
//! Application-facing facade over the protocol engine: fragments outbound
//! messages into I-frames, reassembles inbound fragments into complete
//! messages, queues the lifecycle control frames, and owns the background
//! thread that drives [`Engine::poll`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::engine::{ApciParameters, Engine, LinkState, MessageQueue};
use crate::frame::{self, ControlFrame, MAX_FRAGMENT_SIZE};
use crate::transport::Transport;

/// Connection lifecycle events surfaced to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Peer requested START
    Started,
    /// Our START was confirmed
    StartConfirmed,
    /// Peer requested RESET
    Reset,
    /// Our RESET was confirmed
    ResetConfirmed,
    /// Peer requested STOP
    Stopped,
    /// Our STOP was confirmed
    StopConfirmed,
    /// Fatal protocol error or liveness failure; the link was reset
    LinkBroken,
}

/// Callback for a complete reassembled message; return `false` to have the
/// link stop delivering
pub type ReceiveHandler = Box<dyn FnMut(&[u8]) -> bool + Send>;
/// Callback for connection events; on [`ConnectionEvent::LinkBroken`] the
/// return value decides whether the polling loop keeps running
pub type ConnectionHandler = Box<dyn FnMut(ConnectionEvent) -> bool + Send>;

fn event_for(kind: ControlFrame) -> Option<ConnectionEvent> {
    match kind {
        ControlFrame::Start => Some(ConnectionEvent::Started),
        ControlFrame::StartConfirm => Some(ConnectionEvent::StartConfirmed),
        ControlFrame::Reset => Some(ConnectionEvent::Reset),
        ControlFrame::ResetConfirm => Some(ConnectionEvent::ResetConfirmed),
        ControlFrame::Stop => Some(ConnectionEvent::Stopped),
        ControlFrame::StopConfirm => Some(ConnectionEvent::StopConfirmed),
        ControlFrame::Test | ControlFrame::TestConfirm => None,
    }
}

/// Segmentation facade and background-thread owner for one link
pub struct Master {
    engine: Arc<Mutex<Engine>>,
    queue: MessageQueue,
    assembly: Arc<Mutex<Vec<u8>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    receive_handler: Option<ReceiveHandler>,
    connection_handler: Arc<Mutex<Option<ConnectionHandler>>>,
}

impl Master {
    /// Create a master over the given transport with the default timing
    /// parameters
    pub fn new(transport: Box<dyn Transport>, params: ApciParameters) -> Self {
        Self::with_engine(Engine::new(transport, params))
    }

    /// Create a master around a pre-built engine (used to inject custom
    /// synchronizer timeouts)
    pub fn with_engine(engine: Engine) -> Self {
        let queue = engine.queue();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            queue,
            assembly: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            receive_handler: None,
            connection_handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the callback invoked with each complete reassembled
    /// message. Must be called before [`Master::start`].
    pub fn set_receive_handler(&mut self, handler: ReceiveHandler) {
        self.receive_handler = Some(handler);
    }

    /// Register the callback invoked on connection events
    pub fn set_connection_handler(&mut self, handler: ConnectionHandler) {
        if let Ok(mut slot) = self.connection_handler.lock() {
            *slot = Some(handler);
        }
    }

    /// Queue `data` for transmission, splitting it into as many I-frames as
    /// needed; every fragment except the last is marked "more follows"
    pub fn send(&self, data: &[u8]) {
        let mut pos = 0;
        while pos < data.len() {
            let end = usize::min(pos + MAX_FRAGMENT_SIZE, data.len());
            let more = end < data.len();
            if let Some(frame) = frame::prepare_iframe(&data[pos..end], more) {
                self.queue.push_frame(frame);
            }
            pos = end;
        }
        debug!("queued {} bytes in {} frames", data.len(), self.queue.len());
    }

    /// Ask the peer to start data transfer (queues START)
    pub fn begin_transfer(&self) {
        self.queue
            .push_frame(frame::prepare_uframe(ControlFrame::Start).to_vec());
    }

    /// Ask the peer to reset sequence state (queues RESET)
    pub fn reset_transfer(&self) {
        self.queue
            .push_frame(frame::prepare_uframe(ControlFrame::Reset).to_vec());
    }

    /// Ask the peer to stop data transfer (queues STOP)
    pub fn end_transfer(&self) {
        self.queue
            .push_frame(frame::prepare_uframe(ControlFrame::Stop).to_vec());
    }

    /// Spawn the background polling thread. Calling this while the thread
    /// is already running is a no-op.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }

        self.wire_handlers();
        self.running.store(true, Ordering::SeqCst);

        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let connection_handler = Arc::clone(&self.connection_handler);

        self.worker = Some(std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                let result = match engine.lock() {
                    Ok(mut engine) => engine.poll(),
                    Err(_) => break,
                };

                if let Err(e) = result {
                    error!("link broken: {}", e);
                    let keep_running = connection_handler
                        .lock()
                        .ok()
                        .and_then(|mut slot| {
                            slot.as_mut().map(|h| h(ConnectionEvent::LinkBroken))
                        })
                        .unwrap_or(false);
                    if !keep_running {
                        running.store(false, Ordering::SeqCst);
                    }
                }
            }
        }));
    }

    /// Stop the background thread cooperatively, join it and clear all
    /// buffers, including any partially reassembled message. Safe to call
    /// repeatedly.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("link worker thread panicked");
            }
        }
        self.queue.clear();
        if let Ok(mut assembly) = self.assembly.lock() {
            assembly.clear();
        }
    }

    /// Current state of the underlying engine
    pub fn state(&self) -> LinkState {
        self.engine
            .lock()
            .map(|e| e.state())
            .unwrap_or(LinkState::Reset)
    }

    /// Number of frames waiting in the send queue
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Install the reassembly and event-mapping closures on the engine
    fn wire_handlers(&mut self) {
        let Ok(mut engine) = self.engine.lock() else {
            return;
        };

        if let Some(mut receive) = self.receive_handler.take() {
            // the buffer is shared with stop(), which discards any
            // half-assembled message
            let assembly = Arc::clone(&self.assembly);
            engine.set_fragment_handler(Box::new(move |chunk, more| {
                let Ok(mut assembly) = assembly.lock() else {
                    return true;
                };
                assembly.extend_from_slice(chunk);
                if more {
                    return true;
                }
                let keep = receive(&assembly);
                debug!("delivered message of {} bytes", assembly.len());
                assembly.clear();
                keep
            }));
        }

        let connection_handler = Arc::clone(&self.connection_handler);
        engine.set_control_handler(Box::new(move |kind| {
            let Some(event) = event_for(kind) else {
                return true;
            };
            connection_handler
                .lock()
                .ok()
                .and_then(|mut slot| slot.as_mut().map(|h| h(event)))
                .unwrap_or(true)
        }));
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mapping() {
        assert_eq!(
            event_for(ControlFrame::Start),
            Some(ConnectionEvent::Started)
        );
        assert_eq!(
            event_for(ControlFrame::StopConfirm),
            Some(ConnectionEvent::StopConfirmed)
        );
        assert_eq!(event_for(ControlFrame::Test), None);
        assert_eq!(event_for(ControlFrame::TestConfirm), None);
    }
}
