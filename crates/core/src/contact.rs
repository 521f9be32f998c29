//! Contact model as seen by the background subsystems.
//!
//! Contacts are owned by the CRUD layer; workers only read them, toggle tags and
//! address mail to them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AudienceId, ContactId, TagId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub audience_id: AudienceId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Free-form string attributes (`attributes.<key>` in segment filters).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<TagId>,
    pub subscribed: bool,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(audience_id: AudienceId, email: impl Into<String>) -> Self {
        Self {
            id: ContactId::new(),
            audience_id,
            email: email.into(),
            first_name: None,
            last_name: None,
            attributes: BTreeMap::new(),
            tags: BTreeSet::new(),
            subscribed: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: ContactId) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: TagId) -> Self {
        self.tags.insert(tag);
        self
    }

    pub fn has_tag(&self, tag: &TagId) -> bool {
        self.tags.contains(tag)
    }

    /// Returns `true` when the tag was newly added.
    pub fn add_tag(&mut self, tag: TagId) -> bool {
        self.tags.insert(tag)
    }

    /// Returns `true` when the tag was present.
    pub fn remove_tag(&mut self, tag: &TagId) -> bool {
        self.tags.remove(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_toggles_report_change() {
        let tag = TagId::new();
        let mut contact = Contact::new(AudienceId::new(), "ada@example.com");

        assert!(contact.add_tag(tag));
        assert!(!contact.add_tag(tag));
        assert!(contact.has_tag(&tag));
        assert!(contact.remove_tag(&tag));
        assert!(!contact.remove_tag(&tag));
    }

    #[test]
    fn deserializes_camel_case_without_optional_collections() {
        let contact: Contact = serde_json::from_value(serde_json::json!({
            "id": "018f3a3e-0000-7000-8000-000000000001",
            "audienceId": "018f3a3e-0000-7000-8000-000000000002",
            "email": "grace@example.com",
            "firstName": "Grace",
            "lastName": null,
            "subscribed": true,
            "createdAt": "2024-05-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(contact.first_name.as_deref(), Some("Grace"));
        assert!(contact.tags.is_empty());
        assert!(contact.attributes.is_empty());
    }
}
