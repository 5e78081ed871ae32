use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

pub type SessionId = String;

/// Outbox capacity before a session's frames start being dropped.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// One live SSE connection.
///
/// Holds a bounded outbox of pre-encoded SSE frames and the connection's
/// lifecycle state. Sends are gated on `state`, not on whether the outbox
/// channel happens to still be open, which stays correct even once the
/// channel is dropped out from under a concurrent sender.
pub struct Session {
    id: SessionId,
    outbox: mpsc::Sender<String>,
    state: AtomicU8,
}

impl Session {
    /// Creates a session and the receiving half of its outbox, which the
    /// caller turns into the client-facing SSE stream.
    pub fn new(id: SessionId) -> (Self, mpsc::Receiver<String>) {
        Self::with_capacity(id, DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_capacity(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Session {
                id,
                outbox: tx,
                state: AtomicU8::new(OPEN),
            },
            rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Enqueues an already-encoded SSE frame. Never blocks: if the session
    /// isn't OPEN or the outbox is full, the frame is dropped and counted
    /// as lost for this session — never surfaced as a publish error
    ///.
    pub fn send_frame(&self, frame: String) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.outbox.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(session_id = %self.id, "outbox full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, "outbox closed, dropping frame");
                false
            }
        }
    }

    /// OPEN -> CLOSING, on write error or peer disconnect. Idempotent: only
    /// the first caller observes `true`.
    pub fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// CLOSING -> CLOSED once the outbox has been drained or discarded.
    /// Idempotent: only the first caller observes `true`, which is what the
    /// registry's close hook gates on to run exactly once.
    pub fn finish_closing(&self) -> bool {
        self.state
            .compare_exchange(CLOSING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_open_and_accepts_frames() {
        let (session, mut rx) = Session::new("s1".to_string());
        assert!(session.is_open());
        assert!(session.send_frame("data: 1\n\n".to_string()));
        assert_eq!(rx.try_recv().unwrap(), "data: 1\n\n");
    }

    #[test]
    fn state_machine_is_one_way() {
        let (session, _rx) = Session::new("s1".to_string());
        assert!(session.begin_closing());
        assert!(!session.begin_closing(), "second call must not re-fire");
        assert!(!session.is_open());
        assert!(session.finish_closing());
        assert!(!session.finish_closing(), "second call must not re-fire");
        assert!(session.is_closed());
    }

    #[test]
    fn drops_frames_once_not_open() {
        let (session, _rx) = Session::new("s1".to_string());
        session.begin_closing();
        assert!(!session.send_frame("data: late\n\n".to_string()));
    }

    #[test]
    fn drops_frames_when_outbox_full() {
        let (session, _rx) = Session::with_capacity("s1".to_string(), 1);
        assert!(session.send_frame("data: 1\n\n".to_string()));
        assert!(!session.send_frame("data: 2\n\n".to_string()));
    }
}
