//! Group authorization filter
//!
//! Decides whether group-scoped traffic may pass. The allow-list, when
//! non-empty, is the only rule; otherwise the deny-list applies; with both
//! empty everything passes. Messages without a group id always pass.

use std::collections::HashSet;

/// Allow/deny filter over numeric group ids
#[derive(Debug, Clone, Default)]
pub struct AuthFilter {
    allow: HashSet<i64>,
    deny: HashSet<i64>,
}

impl AuthFilter {
    /// Create a filter from the two lists
    pub fn new(allow: HashSet<i64>, deny: HashSet<i64>) -> Self {
        Self { allow, deny }
    }

    /// Whether a message scoped to `group_id` should be forwarded
    pub fn allows(&self, group_id: Option<i64>) -> bool {
        let Some(group_id) = group_id else {
            return true;
        };

        if !self.allow.is_empty() {
            let allowed = self.allow.contains(&group_id);
            if allowed {
                tracing::info!(group_id, "Forwarding allow-listed group");
            } else {
                tracing::debug!(group_id, "Dropping group not on allow-list");
            }
            return allowed;
        }

        if !self.deny.is_empty() {
            let denied = self.deny.contains(&group_id);
            if denied {
                tracing::info!(group_id, "Dropping deny-listed group");
            } else {
                tracing::debug!(group_id, "Forwarding group not on deny-list");
            }
            return !denied;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(allow: &[i64], deny: &[i64]) -> AuthFilter {
        AuthFilter::new(allow.iter().copied().collect(), deny.iter().copied().collect())
    }

    #[test]
    fn test_no_group_always_allowed() {
        assert!(filter(&[], &[]).allows(None));
        assert!(filter(&[1], &[]).allows(None));
        assert!(filter(&[], &[1]).allows(None));
    }

    #[test]
    fn test_empty_lists_allow_everything() {
        let auth = filter(&[], &[]);

        for g in [0, 1, 555, -7, i64::MAX] {
            assert!(auth.allows(Some(g)));
        }
    }

    #[test]
    fn test_allow_list_is_authoritative() {
        let auth = filter(&[10, 20], &[10, 30]);

        // Deny-list is ignored while the allow-list is non-empty
        assert!(auth.allows(Some(10)));
        assert!(auth.allows(Some(20)));
        assert!(!auth.allows(Some(30)));
        assert!(!auth.allows(Some(40)));
    }

    #[test]
    fn test_deny_list_without_allow_list() {
        let auth = filter(&[], &[555]);

        assert!(!auth.allows(Some(555)));
        assert!(auth.allows(Some(556)));
    }

    #[test]
    fn test_allow_property_over_range() {
        let allow: HashSet<i64> = (0..100).filter(|g| g % 3 == 0).collect();
        let deny: HashSet<i64> = (0..100).filter(|g| g % 5 == 0).collect();

        let both = AuthFilter::new(allow.clone(), deny.clone());
        let deny_only = AuthFilter::new(HashSet::new(), deny.clone());

        for g in 0..100 {
            assert_eq!(both.allows(Some(g)), allow.contains(&g));
            assert_eq!(deny_only.allows(Some(g)), !deny.contains(&g));
        }
    }
}
