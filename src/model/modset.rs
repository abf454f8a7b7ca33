//! Set of mod ids held by a user or a server.
//!
//! Historically these were stored as comma-joined id strings. At the model
//! boundary they are plain sets: ordering is irrelevant and duplicates
//! collapse.

use crate::model::records::ModId;
use crate::ModwardenError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Distinct set of mod ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModSet(BTreeSet<ModId>);

impl ModSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a legacy comma-joined id list.
    ///
    /// Blank entries and surrounding whitespace are ignored; a non-numeric
    /// entry is a `CorruptRecord` error rather than a silent drop.
    pub fn parse_csv(raw: &str) -> Result<Self, ModwardenError> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<ModId>().map_err(|e| {
                    ModwardenError::CorruptRecord(format!("Bad mod id {:?}: {}", s, e))
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Render as a comma-joined id list (ascending).
    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(ModId::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether `id` is in the set.
    pub fn contains(&self, id: ModId) -> bool {
        self.0.contains(&id)
    }

    /// Add `id`; returns `true` if it was not present.
    pub fn insert(&mut self, id: ModId) -> bool {
        self.0.insert(id)
    }

    /// Remove `id`; returns `true` if it was present.
    pub fn remove(&mut self, id: ModId) -> bool {
        self.0.remove(&id)
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ModId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ModId> for ModSet {
    fn from_iter<I: IntoIterator<Item = ModId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[ModId; N]> for ModSet {
    fn from(ids: [ModId; N]) -> Self {
        ids.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_basic() {
        let set = ModSet::parse_csv("3,1,2").unwrap();
        assert_eq!(set, ModSet::from([1, 2, 3]));
    }

    #[test]
    fn test_parse_csv_tolerates_blanks_and_spaces() {
        let set = ModSet::parse_csv(" 4 , ,7,").unwrap();
        assert_eq!(set, ModSet::from([4, 7]));
    }

    #[test]
    fn test_parse_csv_empty() {
        assert!(ModSet::parse_csv("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_csv_duplicates_collapse() {
        let set = ModSet::parse_csv("5,5,5").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_parse_csv_rejects_garbage() {
        let err = ModSet::parse_csv("1,two,3").unwrap_err();
        assert!(matches!(err, ModwardenError::CorruptRecord(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_to_csv_is_sorted() {
        let set = ModSet::from([9, 2, 5]);
        assert_eq!(set.to_csv(), "2,5,9");
    }

    #[test]
    fn test_remove_reports_presence() {
        let mut set = ModSet::from([1, 2]);
        assert!(set.remove(2));
        assert!(!set.remove(2));
        assert!(!set.contains(2));
    }

    #[test]
    fn test_serde_as_plain_array() {
        let set = ModSet::from([2, 1]);
        assert_eq!(serde_json::to_string(&set).unwrap(), "[1,2]");
    }
}
