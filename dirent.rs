//! Directory entries and their owner/group/other permission bits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::identity::{self, GroupId, GroupRegistry, UserId};
use crate::metadata::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirentId(pub u64);

impl fmt::Display for DirentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirentKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
}

/// Read/write bits for one of owner, group or other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
}

impl Access {
    pub const NONE: Access = Access::new(false, false);
    pub const READ: Access = Access::new(true, false);
    pub const WRITE: Access = Access::new(false, true);
    pub const READ_WRITE: Access = Access::new(true, true);

    pub const fn new(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    pub fn allows(&self, cap: Capability) -> bool {
        match cap {
            Capability::Read => self.read,
            Capability::Write => self.write,
        }
    }

    fn from_triad(bits: u32) -> Self {
        Self::new(bits & 0o4 != 0, bits & 0o2 != 0)
    }

    fn triad(&self) -> u32 {
        (if self.read { 0o4 } else { 0 }) | (if self.write { 0o2 } else { 0 })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub owner: Access,
    pub group: Access,
    pub other: Access,
}

impl Permissions {
    pub const fn new(owner: Access, group: Access, other: Access) -> Self {
        Self {
            owner,
            group,
            other,
        }
    }

    /// Build from a Unix-style mode such as `0o640`. Execute bits are ignored.
    pub fn from_mode(mode: u32) -> Self {
        Self {
            owner: Access::from_triad(mode >> 6),
            group: Access::from_triad(mode >> 3),
            other: Access::from_triad(mode),
        }
    }

    pub fn mode(&self) -> u32 {
        (self.owner.triad() << 6) | (self.group.triad() << 3) | self.other.triad()
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for access in [self.owner, self.group, self.other] {
            write!(
                f,
                "{}{}-",
                if access.read { 'r' } else { '-' },
                if access.write { 'w' } else { '-' },
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirent {
    pub id: DirentId,
    /// `None` only for the root directory.
    pub parent: Option<DirentId>,
    pub name: String,
    pub kind: DirentKind,
    pub owner: UserId,
    pub group: GroupId,
    pub permissions: Permissions,
}

impl Dirent {
    pub fn is_dir(&self) -> bool {
        self.kind == DirentKind::Directory
    }

    /// Owner bit, group bit and other bit are independent checks OR-ed
    /// together; any one of them is enough.
    pub fn has_capability(&self, user: UserId, cap: Capability, groups: &GroupRegistry) -> bool {
        if user == self.owner && self.permissions.owner.allows(cap) {
            return true;
        }

        if self.permissions.group.allows(cap) && identity::is_member(groups, self.group, user) {
            return true;
        }

        self.permissions.other.allows(cap)
    }

    pub fn can_read(&self, user: UserId, groups: &GroupRegistry) -> bool {
        self.has_capability(user, Capability::Read, groups)
    }

    pub fn can_write(&self, user: UserId, groups: &GroupRegistry) -> bool {
        self.has_capability(user, Capability::Write, groups)
    }
}

impl Record for Dirent {
    type Id = DirentId;
    const KIND: &'static str = "dirents";

    fn id(&self) -> DirentId {
        self.id
    }
}

pub type DirentTable = HashMap<DirentId, Dirent>;
