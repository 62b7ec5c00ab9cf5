use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::error;

use crate::session::SessionHandle;

/// Notified once when a session is torn down because of an error. This is the hook for
///  reconnect policies, which live outside the session.
///
/// The call happens on a separate task, so a slow handler does not delay the teardown itself.
///  Orderly shutdown via [SessionHandle::disconnect] and failures during session start (which
///  are returned to the caller) are not reported here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionLostHandler: Send + Sync + 'static {
    async fn on_connection_lost(&self, session: SessionHandle, error: anyhow::Error);
}

/// Logs the error and does nothing else
#[derive(Debug, Default)]
pub struct LoggingConnectionLostHandler;

#[async_trait]
impl ConnectionLostHandler for LoggingConnectionLostHandler {
    async fn on_connection_lost(&self, session: SessionHandle, error: anyhow::Error) {
        error!(session_id = ?session.id(), "connection lost: {:#}", error);
    }
}
