use std::collections::HashMap;

use shared::{
    domain::{Identity, MemberStatus},
    protocol::{supersedes, MemberRecord, Revision},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub identity: Identity,
    pub status: MemberStatus,
}

impl From<MemberRecord> for Member {
    fn from(value: MemberRecord) -> Self {
        Self {
            identity: value.identity,
            status: value.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MemberChange {
    Joined(Member),
    Changed(Member),
    Unchanged,
}

/// Membership of one channel, in the order identities were first seen.
///
/// Revisions outlive removal, so a delayed record from before a member left
/// cannot bring them back.
#[derive(Debug, Default)]
pub(crate) struct MemberSet {
    order: Vec<Identity>,
    members: HashMap<Identity, MemberStatus>,
    revisions: HashMap<Identity, Revision>,
}

impl MemberSet {
    pub(crate) fn get(&self, identity: &Identity) -> Option<Member> {
        self.members.get(identity).map(|status| Member {
            identity: identity.clone(),
            status: *status,
        })
    }

    pub(crate) fn all(&self) -> Vec<Member> {
        self.order
            .iter()
            .filter_map(|identity| self.get(identity))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Adding grants joined membership outright.
    pub(crate) fn add(&mut self, identity: Identity) -> MemberChange {
        self.upsert(identity, MemberStatus::Joined)
    }

    /// Inviting never downgrades an identity that already joined.
    pub(crate) fn invite(&mut self, identity: Identity) -> MemberChange {
        if self.members.get(&identity) == Some(&MemberStatus::Joined) {
            return MemberChange::Unchanged;
        }
        self.upsert(identity, MemberStatus::Invited)
    }

    /// Applies a server record unless a newer revision for the identity was
    /// already seen.
    pub(crate) fn apply(&mut self, record: MemberRecord) -> MemberChange {
        if !self.advance(&record.identity, record.revision) {
            return MemberChange::Unchanged;
        }
        self.upsert(record.identity, record.status)
    }

    fn upsert(&mut self, identity: Identity, status: MemberStatus) -> MemberChange {
        match self.members.get_mut(&identity) {
            Some(current) if *current == status => MemberChange::Unchanged,
            Some(current) => {
                *current = status;
                MemberChange::Changed(Member { identity, status })
            }
            None => {
                self.order.push(identity.clone());
                self.members.insert(identity.clone(), status);
                MemberChange::Joined(Member { identity, status })
            }
        }
    }

    /// Evicts an identity. A removal stamped older than the member's current
    /// row is ignored.
    pub(crate) fn remove(&mut self, identity: &Identity, revision: Revision) -> Option<Member> {
        if !self.advance(identity, revision) {
            return None;
        }
        let status = self.members.remove(identity)?;
        self.order.retain(|existing| existing != identity);
        Some(Member {
            identity: identity.clone(),
            status,
        })
    }

    /// Merges a server listing. Rows missing from the listing are kept, since
    /// the listing may predate membership changes applied since it was taken.
    pub(crate) fn merge(&mut self, records: Vec<MemberRecord>) -> Vec<MemberChange> {
        records
            .into_iter()
            .map(|record| self.apply(record))
            .filter(|change| *change != MemberChange::Unchanged)
            .collect()
    }

    fn advance(&mut self, identity: &Identity, revision: Revision) -> bool {
        let known = self.revisions.get(identity).copied().unwrap_or_default();
        if !supersedes(revision, known) {
            return false;
        }
        if revision > known {
            self.revisions.insert(identity.clone(), revision);
        }
        true
    }
}
