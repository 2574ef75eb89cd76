//! Create/update/read permission checks over a single dirent.

use crate::dirent::Dirent;
use crate::error::PermissionsError;
use crate::identity::{GroupRegistry, UserId};

/// To create a dirent, we only need write on the parent directory.
/// The new entry does not exist yet, so its own bits play no part.
pub fn check_create(
    user: UserId,
    parent: &Dirent,
    groups: &GroupRegistry,
) -> Result<(), PermissionsError> {
    if !parent.can_write(user, groups) {
        return Err(PermissionsError::Create {
            user,
            parent: parent.id,
        });
    }

    Ok(())
}

/// To update a file's contents, we need write on the file itself (not the parent).
pub fn check_update(
    user: UserId,
    target: &Dirent,
    groups: &GroupRegistry,
) -> Result<(), PermissionsError> {
    if !target.can_write(user, groups) {
        return Err(PermissionsError::Update {
            user,
            target: target.id,
        });
    }

    Ok(())
}

pub fn check_read(
    user: UserId,
    target: &Dirent,
    groups: &GroupRegistry,
) -> Result<(), PermissionsError> {
    if !target.can_read(user, groups) {
        return Err(PermissionsError::Read {
            user,
            target: target.id,
        });
    }

    Ok(())
}
