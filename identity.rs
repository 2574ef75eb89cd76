//! Users, groups and the in-memory registries that hold them.
//!
//! Registries are plain maps owned by whoever loaded them (usually a
//! [`MetadataStore`](crate::store::MetadataStore)) and passed by reference to
//! the codec and the permission checker.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::metadata::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl Record for User {
    type Id = UserId;
    const KIND: &'static str = "users";

    fn id(&self) -> UserId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub owner: UserId,
    #[serde(default)]
    pub members: BTreeSet<UserId>,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>, owner: UserId) -> Self {
        Self {
            id,
            name: name.into(),
            owner,
            members: BTreeSet::new(),
        }
    }

    /// Explicit membership only; owning a group does not imply membership.
    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains(&user)
    }

    /// Returns false if the user was already a member.
    pub fn add_member(&mut self, user: UserId) -> bool {
        self.members.insert(user)
    }
}

impl Record for Group {
    type Id = GroupId;
    const KIND: &'static str = "groups";

    fn id(&self) -> GroupId {
        self.id
    }
}

pub type UserRegistry = HashMap<UserId, User>;
pub type GroupRegistry = HashMap<GroupId, Group>;

/// Whether `user` belongs to `group` according to `groups`.
/// Unknown groups have no members.
pub fn is_member(groups: &GroupRegistry, group: GroupId, user: UserId) -> bool {
    groups.get(&group).is_some_and(|g| g.is_member(user))
}
