use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

/// Why a relayed turn ended. Only the first recorded cause sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    /// Backend reached end-of-stream cleanly.
    Completed,
    /// Backend rejected or failed the invocation before handing back a stream.
    InvocationFailed,
    /// Backend stream errored after forwarding began.
    BackendFailed,
    /// Client went away: the response body was dropped or a write failed.
    ClientGone,
    /// Client asked for the turn to stop through the abort endpoint.
    ClientCancelled,
}

impl TerminalCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::InvocationFailed => "invocation_failed",
            Self::BackendFailed => "backend_failed",
            Self::ClientGone => "client_gone",
            Self::ClientCancelled => "client_cancelled",
        }
    }
}

/// The three cancellation handles of one relayed turn.
///
/// `backend` and `poller` are children of `client`, so cancelling the client
/// token tears down both. Cancelling a child never reaches the client token.
#[derive(Debug)]
pub struct CancellationDomain {
    client: CancellationToken,
    backend: CancellationToken,
    poller: CancellationToken,
    cause: OnceLock<TerminalCause>,
}

impl Default for CancellationDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationDomain {
    pub fn new() -> Self {
        let client = CancellationToken::new();
        let backend = client.child_token();
        let poller = client.child_token();
        Self {
            client,
            backend,
            poller,
            cause: OnceLock::new(),
        }
    }

    pub fn client_token(&self) -> CancellationToken {
        self.client.clone()
    }

    pub fn backend_token(&self) -> CancellationToken {
        self.backend.clone()
    }

    pub fn poller_token(&self) -> CancellationToken {
        self.poller.clone()
    }

    /// Records `cause` if nothing was recorded yet, then stops the backend read
    /// and the poller. Safe to call any number of times; returns `true` only for
    /// the call whose cause was recorded.
    pub fn terminate(&self, cause: TerminalCause) -> bool {
        let first = self.cause.set(cause).is_ok();
        if first {
            tracing::debug!(cause = cause.as_str(), "cancellation domain terminated");
        }
        self.backend.cancel();
        self.poller.cancel();
        first
    }

    /// Client-side trigger: fires the client token, which cascades to both
    /// children.
    pub fn cancel_client(&self, cause: TerminalCause) -> bool {
        let first = self.cause.set(cause).is_ok();
        self.client.cancel();
        first
    }

    pub fn cause(&self) -> Option<TerminalCause> {
        self.cause.get().copied()
    }

    pub fn is_terminated(&self) -> bool {
        self.backend.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_cancel_reaches_backend_and_poller() {
        let domain = CancellationDomain::new();
        let backend = domain.backend_token();
        let poller = domain.poller_token();

        assert!(domain.cancel_client(TerminalCause::ClientGone));

        assert!(backend.is_cancelled());
        assert!(poller.is_cancelled());
        assert_eq!(domain.cause(), Some(TerminalCause::ClientGone));
    }

    #[test]
    fn backend_termination_leaves_client_token_alone() {
        let domain = CancellationDomain::new();
        domain.terminate(TerminalCause::Completed);

        assert!(domain.backend_token().is_cancelled());
        assert!(domain.poller_token().is_cancelled());
        assert!(!domain.client_token().is_cancelled());
    }

    #[test]
    fn first_cause_wins_and_repeats_are_harmless() {
        let domain = CancellationDomain::new();
        assert!(domain.terminate(TerminalCause::BackendFailed));
        assert!(!domain.terminate(TerminalCause::Completed));
        assert!(!domain.cancel_client(TerminalCause::ClientGone));
        assert!(!domain.cancel_client(TerminalCause::ClientGone));
        assert_eq!(domain.cause(), Some(TerminalCause::BackendFailed));
    }
}
