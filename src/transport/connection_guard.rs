use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Close-at-most-once guard for a session's connection.
///
/// The read and write halves of the connection are owned by the inbound and outbound pumps
///  respectively. Closing means flipping this guard: both pumps wait on [ConnectionGuard::closed]
///  alongside their I/O, abandon it, and drop their half, which releases the socket.
///
/// Several paths may race to close (the outbound pump after writing DISCONNECT, the dispatcher
///  during teardown); only the first call to [ConnectionGuard::close] has an effect.
#[derive(Debug, Default)]
pub struct ConnectionGuard {
    closed: AtomicBool,
    close_signal: CancellationToken,
}

impl ConnectionGuard {
    pub fn new() -> ConnectionGuard {
        Default::default()
    }

    /// Returns `true` iff this call actually closed the connection
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("connection already closed");
            return false;
        }
        debug!("closing connection");
        self.close_signal.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// completes once the connection is closed
    pub async fn closed(&self) {
        self.close_signal.cancelled().await
    }
}
