//! Core identifier types
//!
//! Connections behind the same NAT gateway share a remote address, so log
//! lines carry a per-connection id for correlation.

use uuid::Uuid;

/// Unique identifier for an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    /// Generate a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_id_unique() {
        let id1 = ConnId::new();
        let id2 = ConnId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_display() {
        let id = ConnId::new();
        assert!(!format!("{}", id).is_empty());
    }
}
