//! Tenant identity and limited API names

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the logical owner of submitted work
///
/// The nil UUID is reserved for the system tenant. System work bypasses
/// per-tenant rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// The system tenant
    pub const SYSTEM: TenantId = TenantId(Uuid::nil());

    /// Wrap an existing UUID
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a fresh, time-ordered tenant id
    pub fn random() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Check if this is the system tenant
    pub fn is_system(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// API category a rate limit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitedApi {
    /// Read-type backend queries
    ReadQueries,
    /// Write-type backend queries
    WriteQueries,
}

impl std::fmt::Display for LimitedApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadQueries => write!(f, "read_queries"),
            Self::WriteQueries => write!(f, "write_queries"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_tenant() {
        assert!(TenantId::SYSTEM.is_system());
        assert!(!TenantId::random().is_system());
        assert_eq!(TenantId::from(Uuid::nil()), TenantId::SYSTEM);
    }

    #[test]
    fn test_tenant_serializes_as_plain_uuid() {
        let id = Uuid::now_v7();
        let json = serde_json::to_string(&TenantId::new(id)).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_limited_api_display() {
        assert_eq!(LimitedApi::ReadQueries.to_string(), "read_queries");
        assert_eq!(LimitedApi::WriteQueries.to_string(), "write_queries");
    }
}
