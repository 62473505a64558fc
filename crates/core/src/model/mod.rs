//! Result model shared by detectors, the runner, and the harness.
//!
//! Every detector produces a [`FeatureValue`]; the runner collects them into a
//! [`ResultRecord`] whose JSON form is the stable contract consumers read.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Opaque name of a detectable property (e.g. `aslr`, `dynamic_cast`).
pub type FeatureId = String;

/// `"yes"` / `"no"` marker used by occurrence-counting detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detected {
    Yes,
    No,
}

impl Detected {
    pub fn from_count(count: u64) -> Self {
        if count > 0 {
            Detected::Yes
        } else {
            Detected::No
        }
    }
}

/// Value produced for one feature.
///
/// Serialized untagged so the JSON shape depends only on the detector kind:
/// a boolean, `{"detected": "yes", "occurrences": 2}`, a plain string, or an
/// object of sub-feature statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Occurrences { detected: Detected, occurrences: u64 },
    Text(String),
    Table(BTreeMap<String, String>),
}

impl FeatureValue {
    pub fn occurrences(count: u64) -> Self {
        FeatureValue::Occurrences { detected: Detected::from_count(count), occurrences: count }
    }

    /// Collapse the value into a presence bit, as used by the bisection oracle.
    ///
    /// Text counts as present unless it is empty, `none`, or starts with `no`
    /// (hardening-check reports statuses such as `no, not found!`).
    pub fn is_present(&self) -> bool {
        match self {
            FeatureValue::Bool(b) => *b,
            FeatureValue::Occurrences { detected, .. } => *detected == Detected::Yes,
            FeatureValue::Text(text) => text_is_present(text),
            FeatureValue::Table(entries) => entries.values().any(|v| text_is_present(v)),
        }
    }
}

fn text_is_present(text: &str) -> bool {
    let lowered = text.trim().to_ascii_lowercase();
    !(lowered.is_empty() || lowered == "none" || lowered.starts_with("no"))
}

/// Ordered feature -> value mapping, in the order the features were requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultRecord {
    entries: Vec<(FeatureId, FeatureValue)>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a feature value, keeping the original position on replace.
    pub fn insert(&mut self, feature: impl Into<FeatureId>, value: FeatureValue) {
        let feature = feature.into();
        match self.entries.iter_mut().find(|(f, _)| *f == feature) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((feature, value)),
        }
    }

    pub fn get(&self, feature: &str) -> Option<&FeatureValue> {
        self.entries.iter().find(|(f, _)| f == feature).map(|(_, v)| v)
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(f, _)| f.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ResultRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (feature, value) in &self.entries {
            map.serialize_entry(feature, value)?;
        }
        map.end()
    }
}
