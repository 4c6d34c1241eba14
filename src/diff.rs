use std::collections::HashSet;

use crate::roblox::MemberId;

#[derive(Debug, Default, PartialEq)]
pub struct MemberDiff {
    /// In current fetch order.
    pub new_members: Vec<MemberId>,
    /// Sorted; the snapshot has no order of its own.
    pub removed_members: Vec<MemberId>,
}

impl MemberDiff {
    pub fn is_empty(&self) -> bool {
        self.new_members.is_empty() && self.removed_members.is_empty()
    }
}

pub fn compute_diff(previous: &HashSet<MemberId>, current: &[MemberId]) -> MemberDiff {
    let current_set: HashSet<_> = current.iter().collect();
    let mut seen = HashSet::new();

    let mut diff = MemberDiff {
        new_members: current
            .iter()
            .filter(|id| !previous.contains(*id) && seen.insert(*id))
            .cloned()
            .collect(),
        removed_members: previous
            .iter()
            .filter(|id| !current_set.contains(id))
            .cloned()
            .collect(),
    };
    diff.removed_members.sort();
    diff
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn ids(raw: &[&str]) -> Vec<MemberId> {
        raw.iter().map(|id| MemberId::new(*id)).collect()
    }

    fn set(raw: &[&str]) -> HashSet<MemberId> {
        ids(raw).into_iter().collect()
    }

    #[test]
    fn detects_added_and_removed_members() {
        let diff = compute_diff(&set(&["1", "2", "3"]), &ids(&["2", "3", "4"]));
        assert_eq!(diff.new_members, ids(&["4"]));
        assert_eq!(diff.removed_members, ids(&["1"]));
    }

    #[test]
    fn new_members_keep_fetch_order() {
        let diff = compute_diff(&set(&["5"]), &ids(&["9", "5", "3", "7"]));
        assert_eq!(diff.new_members, ids(&["9", "3", "7"]));
    }

    #[test]
    fn duplicate_fetch_entries_are_reported_once() {
        let diff = compute_diff(&HashSet::new(), &ids(&["1", "1", "2"]));
        assert_eq!(diff.new_members, ids(&["1", "2"]));
    }

    #[test_case(&[], &[] ; "both empty")]
    #[test_case(&["1", "2"], &[] ; "everyone left")]
    #[test_case(&[], &["1", "2"] ; "first run")]
    #[test_case(&["1", "2"], &["2", "1"] ; "unchanged")]
    #[test_case(&["1", "2", "3"], &["3", "4", "5"] ; "partial overlap")]
    fn diff_matches_set_subtraction(previous: &[&str], current: &[&str]) {
        let previous = set(previous);
        let current = ids(current);
        let current_set: HashSet<_> = current.iter().cloned().collect();

        let diff = compute_diff(&previous, &current);

        let new: HashSet<_> = diff.new_members.iter().cloned().collect();
        let removed: HashSet<_> = diff.removed_members.iter().cloned().collect();
        assert_eq!(new, &current_set - &previous);
        assert_eq!(removed, &previous - &current_set);
        assert!(new.is_disjoint(&removed));
        assert_eq!(diff.is_empty(), previous == current_set);
    }
}
