//! The identity entity: one author's folded name, image and skills.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::{AboutUpdate, IdentityError, ImageRef, SkillAction, SkillAssignment};

/// Derived state for one author key.
///
/// Values are immutable; every `with_*` method returns a new value. Skill
/// assignments are remembered by the author's feed sequence, so folding the
/// same assignment again leaves the value unchanged and the skill set is
/// always the in-order fold of every assignment seen so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<ImageRef>,
    skills: BTreeSet<String>,
    #[serde(skip)]
    assignments: BTreeMap<u64, (String, SkillAction)>,
}

impl Identity {
    /// An identity with no name, image or skills.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            image: None,
            skills: BTreeSet::new(),
            assignments: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn image(&self) -> Option<&ImageRef> {
        self.image.as_ref()
    }

    pub fn skills(&self) -> &BTreeSet<String> {
        &self.skills
    }

    pub fn has_skill(&self, skill_key: &str) -> bool {
        self.skills.contains(skill_key)
    }

    /// Whether the assignment at this feed sequence has already been folded.
    pub fn has_assignment(&self, sequence: u64) -> bool {
        self.assignments.contains_key(&sequence)
    }

    pub fn with_name_update(&self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self.clone()
        }
    }

    pub fn with_image_update(&self, image: ImageRef) -> Self {
        Self {
            image: Some(image),
            ..self.clone()
        }
    }

    pub fn with_about(&self, update: &AboutUpdate) -> Self {
        match update {
            AboutUpdate::Name(name) => self.with_name_update(name.clone()),
            AboutUpdate::Image(image) => self.with_image_update(image.clone()),
        }
    }

    /// Fold one skill assignment.
    ///
    /// Unknown actions, assignments authored by another key, and a different
    /// assignment claiming an already-folded sequence are rejected.
    pub fn with_skill_assignment(&self, assignment: &SkillAssignment) -> Result<Self, IdentityError> {
        let action: SkillAction = assignment
            .action
            .parse()
            .map_err(|reason: String| IdentityError::malformed(&assignment.event_id, reason))?;

        if assignment.author != self.key {
            return Err(IdentityError::malformed(
                &assignment.event_id,
                format!(
                    "assignment authored by {} folded into {}",
                    assignment.author, self.key
                ),
            ));
        }

        let entry = (assignment.skill_key.clone(), action);
        match self.assignments.get(&assignment.sequence) {
            Some(existing) if *existing == entry => return Ok(self.clone()),
            Some(_) => {
                return Err(IdentityError::malformed(
                    &assignment.event_id,
                    format!(
                        "conflicting assignment at sequence {} of {}",
                        assignment.sequence, self.key
                    ),
                ));
            }
            None => {}
        }

        let mut updated = self.clone();
        let appended = updated
            .assignments
            .last_key_value()
            .is_none_or(|(last, _)| *last < assignment.sequence);
        updated.assignments.insert(assignment.sequence, entry);

        if appended {
            apply_action(&mut updated.skills, &assignment.skill_key, action);
        } else {
            // Landed before a later assignment; rebuild from the full history.
            updated.skills = BTreeSet::new();
            for (skill_key, action) in updated.assignments.values() {
                apply_action(&mut updated.skills, skill_key, *action);
            }
        }

        Ok(updated)
    }
}

fn apply_action(skills: &mut BTreeSet<String>, skill_key: &str, action: SkillAction) {
    match action {
        SkillAction::Assign => {
            skills.insert(skill_key.to_string());
        }
        SkillAction::Unassign => {
            skills.remove(skill_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn assignment(sequence: u64, skill_key: &str, action: &str) -> SkillAssignment {
        SkillAssignment {
            event_id: format!("%evt{}", sequence),
            author: "bob".to_string(),
            sequence,
            skill_key: skill_key.to_string(),
            action: action.to_string(),
        }
    }

    fn skills(identity: &Identity) -> Vec<&str> {
        identity.skills().iter().map(String::as_str).collect()
    }

    #[test]
    fn test_default_identity_is_empty() {
        let identity = Identity::new("alice");
        assert_eq!(identity.key(), "alice");
        assert!(identity.name().is_none());
        assert!(identity.image().is_none());
        assert!(identity.skills().is_empty());
    }

    #[test]
    fn test_name_update_returns_new_value() {
        let original = Identity::new("alice");
        let updated = original.with_name_update("Alice");
        assert_eq!(updated.name(), Some("Alice"));
        assert!(original.name().is_none());
        assert_eq!(updated.with_name_update("Ally").name(), Some("Ally"));
    }

    #[test]
    fn test_image_update_replaces_image() {
        let image = ImageRef {
            link: "&img.sha256".to_string(),
            size: 42,
            mime_type: "image/png".to_string(),
        };
        let updated = Identity::new("alice").with_about(&AboutUpdate::Image(image.clone()));
        assert_eq!(updated.image(), Some(&image));
        assert!(updated.name().is_none());
    }

    #[test]
    fn test_assign_and_unassign() {
        let identity = Identity::new("bob")
            .with_skill_assignment(&assignment(1, "x", "ASSIGN"))
            .unwrap()
            .with_skill_assignment(&assignment(2, "y", "ASSIGN"))
            .unwrap()
            .with_skill_assignment(&assignment(3, "x", "UNASSIGN"))
            .unwrap();
        assert_eq!(skills(&identity), vec!["y"]);
    }

    #[test]
    fn test_assign_twice_is_idempotent() {
        let once = Identity::new("bob")
            .with_skill_assignment(&assignment(1, "x", "ASSIGN"))
            .unwrap();
        let twice = once
            .with_skill_assignment(&assignment(2, "x", "ASSIGN"))
            .unwrap();
        assert_eq!(once.skills(), twice.skills());
    }

    #[test]
    fn test_unassign_absent_is_noop() {
        let identity = Identity::new("bob")
            .with_skill_assignment(&assignment(1, "x", "UNASSIGN"))
            .unwrap();
        assert!(identity.skills().is_empty());
        assert!(identity.has_assignment(1));
    }

    #[test]
    fn test_refolding_same_assignment_is_noop() {
        let identity = Identity::new("bob")
            .with_skill_assignment(&assignment(1, "x", "ASSIGN"))
            .unwrap()
            .with_skill_assignment(&assignment(2, "x", "UNASSIGN"))
            .unwrap();
        let refolded = identity
            .with_skill_assignment(&assignment(1, "x", "ASSIGN"))
            .unwrap();
        assert_eq!(refolded, identity);
        assert!(!refolded.has_skill("x"));
    }

    #[test]
    fn test_late_earlier_assignment_rebuilds_in_order() {
        let identity = Identity::new("bob")
            .with_skill_assignment(&assignment(2, "x", "UNASSIGN"))
            .unwrap()
            .with_skill_assignment(&assignment(1, "x", "ASSIGN"))
            .unwrap();
        assert!(!identity.has_skill("x"));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result = Identity::new("bob").with_skill_assignment(&assignment(1, "x", "PROMOTE"));
        assert!(matches!(result, Err(IdentityError::MalformedEvent { .. })));
    }

    #[test]
    fn test_foreign_author_is_rejected() {
        let result = Identity::new("carol").with_skill_assignment(&assignment(1, "x", "ASSIGN"));
        assert!(matches!(result, Err(IdentityError::MalformedEvent { .. })));
    }

    #[test]
    fn test_conflicting_sequence_is_rejected() {
        let identity = Identity::new("bob")
            .with_skill_assignment(&assignment(1, "x", "ASSIGN"))
            .unwrap();
        let result = identity.with_skill_assignment(&assignment(1, "y", "ASSIGN"));
        assert!(matches!(result, Err(IdentityError::MalformedEvent { .. })));
    }

    #[test]
    fn test_serialized_view_omits_history() {
        let identity = Identity::new("bob")
            .with_name_update("Bob")
            .with_skill_assignment(&assignment(1, "x", "ASSIGN"))
            .unwrap();
        let value = serde_json::to_value(&identity).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"key": "bob", "name": "Bob", "skills": ["x"]})
        );
    }
}
