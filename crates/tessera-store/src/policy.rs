//! Owner policy hooks consulted by the relay.
//!
//! Absence of a policy means "allow everything" ([`AllowAll`]). Policies
//! compose as tuples: `(AllowList, QuotaLimit)` admits an owner only if both
//! do.

use std::collections::HashSet;

use tessera_core::OwnerId;

/// Relay-side admission and quota decisions.
pub trait OwnerPolicy: Send + Sync {
    fn is_owner_allowed(&self, _owner: &OwnerId) -> bool {
        true
    }

    /// `required_bytes` is the owner's stored size plus the incoming batch.
    fn is_owner_within_quota(&self, _owner: &OwnerId, _required_bytes: u64) -> bool {
        true
    }
}

/// Admit every owner without limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl OwnerPolicy for AllowAll {}

/// Fixed storage budget per owner.
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimit {
    pub max_bytes: u64,
}

impl QuotaLimit {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl OwnerPolicy for QuotaLimit {
    fn is_owner_within_quota(&self, _owner: &OwnerId, required_bytes: u64) -> bool {
        required_bytes <= self.max_bytes
    }
}

/// Admit only listed owners.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    owners: HashSet<OwnerId>,
}

impl AllowList {
    pub fn new(owners: impl IntoIterator<Item = OwnerId>) -> Self {
        Self {
            owners: owners.into_iter().collect(),
        }
    }
}

impl OwnerPolicy for AllowList {
    fn is_owner_allowed(&self, owner: &OwnerId) -> bool {
        self.owners.contains(owner)
    }
}

impl<A: OwnerPolicy, B: OwnerPolicy> OwnerPolicy for (A, B) {
    fn is_owner_allowed(&self, owner: &OwnerId) -> bool {
        self.0.is_owner_allowed(owner) && self.1.is_owner_allowed(owner)
    }

    fn is_owner_within_quota(&self, owner: &OwnerId, required_bytes: u64) -> bool {
        self.0.is_owner_within_quota(owner, required_bytes)
            && self.1.is_owner_within_quota(owner, required_bytes)
    }
}

impl<P: OwnerPolicy + ?Sized> OwnerPolicy for Box<P> {
    fn is_owner_allowed(&self, owner: &OwnerId) -> bool {
        (**self).is_owner_allowed(owner)
    }

    fn is_owner_within_quota(&self, owner: &OwnerId, required_bytes: u64) -> bool {
        (**self).is_owner_within_quota(owner, required_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Id;

    fn owner(byte: u8) -> OwnerId {
        OwnerId(Id::from_hash([byte; 16]))
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.is_owner_allowed(&owner(1)));
        assert!(AllowAll.is_owner_within_quota(&owner(1), u64::MAX));
    }

    #[test]
    fn test_quota_limit_boundary() {
        let quota = QuotaLimit::new(100);
        assert!(quota.is_owner_within_quota(&owner(1), 100));
        assert!(!quota.is_owner_within_quota(&owner(1), 101));
    }

    #[test]
    fn test_allow_list() {
        let list = AllowList::new([owner(1)]);
        assert!(list.is_owner_allowed(&owner(1)));
        assert!(!list.is_owner_allowed(&owner(2)));
    }

    #[test]
    fn test_composed_policy() {
        let policy = (AllowList::new([owner(1)]), QuotaLimit::new(10));
        assert!(policy.is_owner_allowed(&owner(1)));
        assert!(!policy.is_owner_allowed(&owner(2)));
        assert!(!policy.is_owner_within_quota(&owner(1), 11));
    }
}
