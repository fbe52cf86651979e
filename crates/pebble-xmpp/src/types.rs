//! Common types for the XMPP server.

use std::fmt;

/// Stream negotiation state.
///
/// States are strictly ordered; the only legal move is to the immediate
/// successor, or to [`NegotiationState::Failed`] from any non-terminal state.
/// The two stream restarts required by the protocol happen inside
/// `Secured` and `Authenticated` and do not revisit earlier states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NegotiationState {
    /// Stream header received, STARTTLS advertised
    Opened,
    /// Waiting for `<starttls/>`
    SecureRequested,
    /// TLS established, waiting for the restarted stream header
    Secured,
    /// SASL mechanisms advertised, waiting for `<auth/>`
    AuthRequested,
    /// SASL succeeded, waiting for the restarted stream header
    Authenticated,
    /// Bind advertised, waiting for the bind `<iq/>`
    BindRequested,
    /// Identifier bound; negotiation complete
    Bound,
    /// Negotiation aborted
    Failed,
}

impl NegotiationState {
    /// The next state on the success path, if any.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Opened => Some(Self::SecureRequested),
            Self::SecureRequested => Some(Self::Secured),
            Self::Secured => Some(Self::AuthRequested),
            Self::AuthRequested => Some(Self::Authenticated),
            Self::Authenticated => Some(Self::BindRequested),
            Self::BindRequested => Some(Self::Bound),
            Self::Bound | Self::Failed => None,
        }
    }

    /// Whether negotiation has ended, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Bound | Self::Failed)
    }

    /// Whether moving from `self` to `next` is legal.
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || self.successor() == Some(next)
    }

    /// State name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::SecureRequested => "secure-requested",
            Self::Secured => "secured",
            Self::AuthRequested => "auth-requested",
            Self::Authenticated => "authenticated",
            Self::BindRequested => "bind-requested",
            Self::Bound => "bound",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a stanza relative to the server, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from a client
    Inbound,
    /// Sent to a client
    Outbound,
}

impl Direction {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}
