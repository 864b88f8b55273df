//! Cooperative cancellation signal.
//!
//! A token is checked at chunk boundaries; in-flight backend calls are never
//! interrupted. Cancelling drops the token's sender so [`CancellationToken::receiver`]
//! becomes ready, which lets a blocking join wait on completion, a timeout
//! and cancellation in one `select!`.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Signal {
    cancelled: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

#[derive(Clone)]
pub struct CancellationToken {
    signal: Arc<Signal>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            signal: Arc::new(Signal {
                cancelled: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    /// A token nobody else holds, so it never fires.
    pub fn none() -> Self {
        Self::new()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.signal.cancelled.store(true, Ordering::SeqCst);
        self.signal.sender.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.cancelled.load(Ordering::SeqCst)
    }

    /// Disconnects when the token is cancelled; never yields a message.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.signal.receiver
    }

    /// Whether both handles refer to the same signal.
    pub fn same_signal(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.signal, &other.signal)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
