//! Session identity attached to every exec invocation.

use std::net::SocketAddr;

use uuid::Uuid;

/// Immutable identity of the session an exec channel belongs to.
///
/// Carried for attribution and logging only; it has no lifecycle behaviour.
/// Passed explicitly into each reporting handle rather than read from any
/// process-wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    principal: Option<String>,
    peer_addr: Option<SocketAddr>,
    session_id: Uuid,
}

impl SessionIdentity {
    /// Create an identity with a fresh session id.
    pub fn new(principal: Option<String>, peer_addr: Option<SocketAddr>) -> Self {
        Self::with_session_id(principal, peer_addr, Uuid::new_v4())
    }

    /// Create an identity with a caller-supplied session id.
    pub const fn with_session_id(
        principal: Option<String>,
        peer_addr: Option<SocketAddr>,
        session_id: Uuid,
    ) -> Self {
        Self {
            principal,
            peer_addr,
            session_id,
        }
    }

    /// Authenticated principal name, when known.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Remote network address, when known.
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Unique session id.
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fresh_identities_get_distinct_session_ids() {
        let a = SessionIdentity::new(None, None);
        let b = SessionIdentity::new(None, None);
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn accessors_expose_construction_values() {
        let addr: SocketAddr = "127.0.0.1:2022".parse().unwrap();
        let id = Uuid::new_v4();
        let identity = SessionIdentity::with_session_id(Some("alice".into()), Some(addr), id);

        assert_eq!(identity.principal(), Some("alice"));
        assert_eq!(identity.peer_addr(), Some(addr));
        assert_eq!(identity.session_id(), id);
    }
}
