//! Owner references as an explicit reference count. Objects shared between
//! projects carry one owner reference per project; the object is deleted
//! only when the last one is released.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnerSet {
    refs: Vec<OwnerReference>,
}

impl OwnerSet {
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            refs: meta.owner_references.clone().unwrap_or_default(),
        }
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.refs.iter().any(|r| r.uid == uid)
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Adds `owner` unless an owner with the same uid is present. A
    /// controlling owner replaces any other controlling owner, and turns an
    /// existing reference with its uid into the controller. Returns whether
    /// the set changed.
    pub fn add(&mut self, owner: &OwnerReference) -> bool {
        let controls = owner.controller == Some(true);
        if let Some(existing) = self.refs.iter().position(|r| r.uid == owner.uid) {
            if !controls || self.refs[existing].controller == Some(true) {
                return false;
            }
            self.refs.retain(|r| r.uid == owner.uid || r.controller != Some(true));
            if let Some(existing) = self.refs.iter_mut().find(|r| r.uid == owner.uid) {
                existing.controller = Some(true);
                existing.block_owner_deletion = owner.block_owner_deletion;
            }
            return true;
        }
        if controls {
            self.refs.retain(|r| r.controller != Some(true));
        }
        self.refs.push(owner.clone());
        true
    }

    /// Returns whether `uid` was an owner.
    pub fn release(&mut self, uid: &str) -> bool {
        let before = self.refs.len();
        self.refs.retain(|r| r.uid != uid);
        before != self.refs.len()
    }

    pub fn apply_to(&self, meta: &mut ObjectMeta) {
        meta.owner_references = if self.refs.is_empty() {
            None
        } else {
            Some(self.refs.clone())
        };
    }
}

pub fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    OwnerSet::from_meta(meta).contains(uid)
}
