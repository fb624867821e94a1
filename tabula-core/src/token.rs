//! The token value record.
//!
//! Tokens are plain values: the replicated document stores snapshots of them,
//! never live references. Runtime annotations (tags, attachment, merge/split
//! bookkeeping) ride along as optional fields so game layers can decorate
//! tokens without the core interpreting them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Free-form metadata carried by a token.
pub type Metadata = HashMap<String, serde_json::Value>;

fn default_kind() -> String {
    "token".to_string()
}

/// Serialize the tag set as a sorted list so every encoding of the same token
/// is byte-identical regardless of set iteration order.
fn sorted_tags<S>(tags: &Option<HashSet<String>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match tags {
        Some(set) => {
            let mut list: Vec<&String> = set.iter().collect();
            list.sort();
            list.serialize(serializer)
        }
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub meta: Metadata,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub index: i64,

    // Runtime annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "sorted_tags"
    )]
    pub tags: Option<HashSet<String>>,
    #[serde(
        rename = "attachedTo",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub attached_to: Option<String>,
    #[serde(
        rename = "attachmentType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub attachment_type: Option<String>,
    #[serde(
        rename = "mergedInto",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub merged_into: Option<String>,
    #[serde(
        rename = "mergedFrom",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub merged_from: Option<Vec<String>>,
    #[serde(
        rename = "splitInto",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub split_into: Option<Vec<String>>,
    #[serde(
        rename = "splitFrom",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub split_from: Option<String>,
}

impl Token {
    /// Minimal constructor used throughout the crate and its tests.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Token {
            id: id.into(),
            text: text.into(),
            kind: default_kind(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Deep copy suitable for storing as a snapshot. Tag-set ordering is
    /// canonicalized at serialization time, so a clone is sufficient here;
    /// the method exists to mark snapshot boundaries in calling code.
    pub fn sanitized(&self) -> Token {
        self.clone()
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.get_or_insert_with(HashSet::new).insert(tag.into());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.as_ref().is_some_and(|t| t.contains(tag))
    }
}
