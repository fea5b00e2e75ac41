//! Log event and payload types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::IdentityError;

/// Event type for name and image updates. Predefined by the log, never prefixed.
pub const ABOUT_TYPE: &str = "about";

/// Event type for skill assignments, before any namespace prefix is applied.
pub const SKILL_ASSIGNMENT_TYPE: &str = "identity-skill_assignment";

/// One authored entry of the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Content-derived event identifier.
    pub id: String,
    /// Key of the author who signed the event.
    pub author: String,
    /// Position of the event in the author's own feed, starting at 1.
    pub sequence: u64,
    /// Claimed creation time.
    pub timestamp: DateTime<Utc>,
    /// JSON object carrying `type` and the type-specific payload.
    pub content: serde_json::Value,
}

impl LogEvent {
    /// The `type` field of the content, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.content.get("type").and_then(serde_json::Value::as_str)
    }
}

/// Reference to a stored image blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Content reference returned by blob storage.
    pub link: String,
    /// Size in bytes.
    pub size: u64,
    /// Declared MIME type.
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// An image file handed to `set_identity_image`.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageFile {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Skill assignment action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkillAction {
    #[serde(rename = "ASSIGN")]
    Assign,
    #[serde(rename = "UNASSIGN")]
    Unassign,
}

impl SkillAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillAction::Assign => "ASSIGN",
            SkillAction::Unassign => "UNASSIGN",
        }
    }
}

impl fmt::Display for SkillAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkillAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ASSIGN" => Ok(SkillAction::Assign),
            "UNASSIGN" => Ok(SkillAction::Unassign),
            other => Err(format!("unknown skill assignment action '{}'", other)),
        }
    }
}

/// Payload of an `about` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AboutContent {
    /// Key of the identity being described.
    pub about: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
}

impl AboutContent {
    pub fn name(about: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            about: about.into(),
            name: Some(name.into()),
            image: None,
        }
    }

    pub fn image(about: impl Into<String>, image: ImageRef) -> Self {
        Self {
            about: about.into(),
            name: None,
            image: Some(image),
        }
    }
}

/// Payload of a skill assignment event.
///
/// `action` stays a raw string here; it is validated when folded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillAssignmentContent {
    pub skill_key: String,
    pub action: String,
}

/// The single field an `about` event updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AboutUpdate {
    Name(String),
    Image(ImageRef),
}

/// A skill assignment read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillAssignment {
    pub event_id: String,
    pub author: String,
    pub sequence: u64,
    pub skill_key: String,
    pub action: String,
}

/// An event decoded into something the projection can fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    About {
        event_id: String,
        author: String,
        update: AboutUpdate,
    },
    SkillAssignment(SkillAssignment),
}

impl IdentityEvent {
    /// Decode a log event.
    ///
    /// Returns `Ok(None)` for event types the projection does not fold.
    pub fn decode(event: &LogEvent, skill_assignment_type: &str) -> Result<Option<Self>, IdentityError> {
        match event.event_type() {
            Some(ABOUT_TYPE) => {
                let content: AboutContent = serde_json::from_value(event.content.clone())
                    .map_err(|e| IdentityError::malformed(&event.id, e.to_string()))?;
                let update = match (content.name, content.image) {
                    (Some(name), None) => AboutUpdate::Name(name),
                    (None, Some(image)) => AboutUpdate::Image(image),
                    (Some(_), Some(_)) => {
                        return Err(IdentityError::malformed(
                            &event.id,
                            "about event carries both name and image",
                        ));
                    }
                    (None, None) => {
                        return Err(IdentityError::malformed(
                            &event.id,
                            "about event carries neither name nor image",
                        ));
                    }
                };
                Ok(Some(IdentityEvent::About {
                    event_id: event.id.clone(),
                    author: event.author.clone(),
                    update,
                }))
            }
            Some(t) if t == skill_assignment_type => {
                let content: SkillAssignmentContent = serde_json::from_value(event.content.clone())
                    .map_err(|e| IdentityError::malformed(&event.id, e.to_string()))?;
                Ok(Some(IdentityEvent::SkillAssignment(SkillAssignment {
                    event_id: event.id.clone(),
                    author: event.author.clone(),
                    sequence: event.sequence,
                    skill_key: content.skill_key,
                    action: content.action,
                })))
            }
            _ => Ok(None),
        }
    }

    /// Author whose identity this event folds into.
    pub fn author(&self) -> &str {
        match self {
            IdentityEvent::About { author, .. } => author,
            IdentityEvent::SkillAssignment(assignment) => &assignment.author,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(content: serde_json::Value) -> LogEvent {
        LogEvent {
            id: "%evt".to_string(),
            author: "@alice".to_string(),
            sequence: 1,
            timestamp: Utc::now(),
            content,
        }
    }

    #[test]
    fn test_decode_about_name() {
        let decoded = IdentityEvent::decode(
            &event(json!({"type": "about", "about": "@alice", "name": "Alice"})),
            SKILL_ASSIGNMENT_TYPE,
        )
        .unwrap()
        .unwrap();
        match decoded {
            IdentityEvent::About { author, update, .. } => {
                assert_eq!(author, "@alice");
                assert_eq!(update, AboutUpdate::Name("Alice".to_string()));
            }
            other => panic!("Expected About, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_about_image() {
        let decoded = IdentityEvent::decode(
            &event(json!({
                "type": "about",
                "about": "@alice",
                "image": {"link": "&abc.sha256", "size": 12, "type": "image/png"}
            })),
            SKILL_ASSIGNMENT_TYPE,
        )
        .unwrap()
        .unwrap();
        let IdentityEvent::About { update, .. } = decoded else {
            panic!("Expected About");
        };
        assert_eq!(
            update,
            AboutUpdate::Image(ImageRef {
                link: "&abc.sha256".to_string(),
                size: 12,
                mime_type: "image/png".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_about_ambiguous_is_malformed() {
        let result = IdentityEvent::decode(
            &event(json!({
                "type": "about",
                "about": "@alice",
                "name": "Alice",
                "image": {"link": "&abc.sha256", "size": 12, "type": "image/png"}
            })),
            SKILL_ASSIGNMENT_TYPE,
        );
        assert!(matches!(result, Err(IdentityError::MalformedEvent { .. })));
    }

    #[test]
    fn test_decode_about_empty_is_malformed() {
        let result = IdentityEvent::decode(
            &event(json!({"type": "about", "about": "@alice"})),
            SKILL_ASSIGNMENT_TYPE,
        );
        assert!(matches!(result, Err(IdentityError::MalformedEvent { .. })));
    }

    #[test]
    fn test_decode_skill_assignment_keeps_raw_action() {
        let decoded = IdentityEvent::decode(
            &event(json!({"type": SKILL_ASSIGNMENT_TYPE, "skillKey": "%rust", "action": "PROMOTE"})),
            SKILL_ASSIGNMENT_TYPE,
        )
        .unwrap()
        .unwrap();
        let IdentityEvent::SkillAssignment(assignment) = decoded else {
            panic!("Expected SkillAssignment");
        };
        assert_eq!(assignment.skill_key, "%rust");
        assert_eq!(assignment.action, "PROMOTE");
        assert_eq!(assignment.sequence, 1);
    }

    #[test]
    fn test_decode_skill_assignment_missing_field_is_malformed() {
        let result = IdentityEvent::decode(
            &event(json!({"type": SKILL_ASSIGNMENT_TYPE, "action": "ASSIGN"})),
            SKILL_ASSIGNMENT_TYPE,
        );
        assert!(matches!(result, Err(IdentityError::MalformedEvent { .. })));
    }

    #[test]
    fn test_decode_prefixed_skill_type() {
        let prefixed = "talenet-identity-skill_assignment";
        let content = json!({"type": prefixed, "skillKey": "%rust", "action": "ASSIGN"});
        assert!(IdentityEvent::decode(&event(content.clone()), prefixed).unwrap().is_some());
        assert!(IdentityEvent::decode(&event(content), SKILL_ASSIGNMENT_TYPE).unwrap().is_none());
    }

    #[test]
    fn test_decode_unrelated_type_is_ignored() {
        let decoded =
            IdentityEvent::decode(&event(json!({"type": "post", "text": "hi"})), SKILL_ASSIGNMENT_TYPE)
                .unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_skill_action_wire_format() {
        assert_eq!(serde_json::to_string(&SkillAction::Assign).unwrap(), "\"ASSIGN\"");
        assert_eq!("UNASSIGN".parse::<SkillAction>(), Ok(SkillAction::Unassign));
        assert!("assign".parse::<SkillAction>().is_err());
    }

    #[test]
    fn test_image_ref_wire_format() {
        let image = ImageRef {
            link: "&abc.sha256".to_string(),
            size: 3,
            mime_type: "image/jpeg".to_string(),
        };
        let value = serde_json::to_value(AboutContent::image("@alice", image)).unwrap();
        assert_eq!(
            value,
            json!({"about": "@alice", "image": {"link": "&abc.sha256", "size": 3, "type": "image/jpeg"}})
        );
    }
}
