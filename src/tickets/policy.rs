//! Authorization lookups
//!
//! Which actors count as staff, and who may bypass ticket quotas, is decided
//! outside the core. The lifecycle only asks these two questions.

use std::collections::HashSet;

/// External role lookup
pub trait AccessPolicy: Send + Sync {
    /// Staff may claim, close directly, and approve or deny close requests
    fn is_staff(&self, actor: &str) -> bool;

    /// Subjects with this privilege are not limited by category quotas
    fn can_bypass_quota(&self, actor: &str) -> bool;
}

/// Fixed lookup table, usually loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    staff: HashSet<String>,
    quota_bypass: HashSet<String>,
}

impl StaticPolicy {
    pub fn new<S, B>(staff: S, quota_bypass: B) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            staff: staff.into_iter().map(Into::into).collect(),
            quota_bypass: quota_bypass.into_iter().map(Into::into).collect(),
        }
    }
}

impl AccessPolicy for StaticPolicy {
    fn is_staff(&self, actor: &str) -> bool {
        self.staff.contains(actor)
    }

    fn can_bypass_quota(&self, actor: &str) -> bool {
        // Staff never queue behind their own quota
        self.quota_bypass.contains(actor) || self.staff.contains(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_policy_lookup() {
        let policy = StaticPolicy::new(["mod-1"], ["vip-1"]);

        assert!(policy.is_staff("mod-1"));
        assert!(!policy.is_staff("vip-1"));
        assert!(policy.can_bypass_quota("vip-1"));
        assert!(policy.can_bypass_quota("mod-1"));
        assert!(!policy.can_bypass_quota("user-1"));
    }
}
