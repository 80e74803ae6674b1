//! Set comparison of identifiers captured before and after a test run

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use super::{OrphanResourceSet, ResourceKind};

/// Every identifier present in exactly one of `before` and `after`, in
/// ascending order.
///
/// Both sets are already ordered, so this is a single merge pass.
pub fn symmetric_difference(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<String> {
    before.symmetric_difference(after).cloned().collect()
}

/// Difference of one resource kind between two scans
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDiff {
    pub kind: ResourceKind,
    /// Present after the run but not before: leaked by the run
    pub appeared: Vec<String>,
    /// Present before the run but gone after it
    pub disappeared: Vec<String>,
}

impl ResourceDiff {
    pub fn between(before: &OrphanResourceSet, after: &OrphanResourceSet) -> Self {
        Self {
            kind: before.kind,
            appeared: after.ids.difference(&before.ids).cloned().collect(),
            disappeared: before.ids.difference(&after.ids).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty()
    }

    /// All differing identifiers, ascending
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .appeared
            .iter()
            .chain(&self.disappeared)
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: appeared [{}], disappeared [{}]",
            self.kind,
            self.appeared.join(", "),
            self.disappeared.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::btree_set;
    use proptest::prelude::*;

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_before_yields_everything_after() {
        assert_eq!(
            symmetric_difference(&BTreeSet::new(), &ids(&["a", "b"])),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn shared_ids_are_dropped() {
        assert_eq!(
            symmetric_difference(&ids(&["i1", "i2"]), &ids(&["i2", "i3"])),
            vec!["i1".to_string(), "i3".to_string()]
        );
    }

    #[test]
    fn comparison_is_exact() {
        assert_eq!(
            symmetric_difference(&ids(&["vol-1"]), &ids(&["VOL-1"])).len(),
            2
        );
    }

    #[test]
    fn display_names_kind_and_ids() {
        let diff = ResourceDiff {
            kind: ResourceKind::Volume,
            appeared: vec!["vol-2".to_string()],
            disappeared: vec![],
        };
        assert_eq!(diff.to_string(), "volume: appeared [vol-2], disappeared []");
    }

    fn id_set() -> impl Strategy<Value = BTreeSet<String>> {
        btree_set("[a-z]-[0-9a-f]{1,4}", 0..40)
    }

    proptest! {
        #[test]
        fn difference_with_itself_is_empty(s in id_set()) {
            prop_assert!(symmetric_difference(&s, &s).is_empty());
        }

        #[test]
        fn difference_is_symmetric(a in id_set(), b in id_set()) {
            prop_assert_eq!(symmetric_difference(&a, &b), symmetric_difference(&b, &a));
        }

        #[test]
        fn every_id_is_in_exactly_one_input(a in id_set(), b in id_set()) {
            let diff = symmetric_difference(&a, &b);
            let unique: BTreeSet<&String> = diff.iter().collect();
            prop_assert_eq!(unique.len(), diff.len());
            for id in &diff {
                prop_assert!(a.contains(id) != b.contains(id));
            }
            for id in a.iter().chain(&b) {
                prop_assert_eq!(diff.contains(id), a.contains(id) != b.contains(id));
            }
        }

        #[test]
        fn appeared_and_disappeared_partition_the_difference(a in id_set(), b in id_set()) {
            let before = OrphanResourceSet { kind: ResourceKind::Instance, ids: a.clone(), filters: vec![] };
            let after = OrphanResourceSet { kind: ResourceKind::Instance, ids: b.clone(), filters: vec![] };
            let diff = ResourceDiff::between(&before, &after);
            prop_assert_eq!(diff.ids(), symmetric_difference(&a, &b));
            prop_assert!(diff.appeared.iter().all(|id| b.contains(id) && !a.contains(id)));
        }
    }
}
