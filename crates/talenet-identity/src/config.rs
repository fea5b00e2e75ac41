//! Adapter configuration.

use serde::{Deserialize, Serialize};

use crate::SKILL_ASSIGNMENT_TYPE;

/// Configuration for [`IdentityAdapter`](crate::IdentityAdapter).
///
/// ```rust
/// use talenet_identity::AdapterConfig;
///
/// let config = AdapterConfig::default().with_type_prefix("talenet-");
/// assert_eq!(config.skill_assignment_type(), "talenet-identity-skill_assignment");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdapterConfig {
    /// Namespace prepended to application event types.
    ///
    /// `about` is defined by the log itself and is never prefixed.
    pub type_prefix: String,
}

impl AdapterConfig {
    pub fn with_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefix = prefix.into();
        self
    }

    /// Full event type of skill assignments.
    pub fn skill_assignment_type(&self) -> String {
        format!("{}{}", self.type_prefix, SKILL_ASSIGNMENT_TYPE)
    }
}
