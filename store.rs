//! The encrypted metadata file and the registries loaded from it.
//!
//! [`MetadataStore`] is the single owner of the group, user and dirent
//! registries. One encrypted file holds three sections, in order:
//!
//! 1. groups
//! 2. users
//! 3. dirents
//!
//! Each section carries its own version, bumped whenever that registry is
//! mutated through the store. Access is single-writer: callers serialize
//! load/mutate/save cycles themselves.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

use crate::cipherio::{CipherReader, CipherWriter, ReadSeekClose, StreamCipher};
use crate::dirent::{Dirent, DirentId, DirentKind, DirentTable, Permissions};
use crate::error::{MetadataError, StoreError};
use crate::identity::{Group, GroupId, GroupRegistry, User, UserId, UserRegistry};
use crate::key_manager::KeyManager;
use crate::metadata::{self, Record};
use crate::permissions;

/// Associated data bound to every chunk of the metadata file
pub const METADATA_LABEL: &[u8] = b"cryptmeta:metadata:v1";

pub const ROOT_USER: UserId = UserId(0);
pub const ROOT_GROUP: GroupId = GroupId(0);
pub const ROOT_DIRENT: DirentId = DirentId(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionVersions {
    pub groups: i64,
    pub users: i64,
    pub dirents: i64,
}

pub struct MetadataStore {
    cipher: StreamCipher,
    path: PathBuf,
    users: UserRegistry,
    groups: GroupRegistry,
    dirents: DirentTable,
    versions: SectionVersions,
}

impl MetadataStore {
    /// An empty store bound to `path`. Nothing is read until [`load`](Self::load).
    pub fn new(km: &KeyManager, path: impl Into<PathBuf>) -> Self {
        Self {
            cipher: km.stream_cipher(),
            path: path.into(),
            users: UserRegistry::new(),
            groups: GroupRegistry::new(),
            dirents: DirentTable::new(),
            versions: SectionVersions::default(),
        }
    }

    pub async fn open(km: &KeyManager, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self::new(km, path);
        store.load().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn dirents(&self) -> &DirentTable {
        &self.dirents
    }

    pub fn versions(&self) -> SectionVersions {
        self.versions
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn dirent(&self, id: DirentId) -> Option<&Dirent> {
        self.dirents.get(&id)
    }

    /// Read the metadata file into the registries.
    /// Existing entries are kept unless the file has the same id. Sections are
    /// parsed into scratch registries first, so a failed load changes nothing.
    pub async fn load(&mut self) -> Result<(), StoreError> {
        debug!(path = %self.path.display(), "loading metadata");
        let mut file = fs::File::open(&self.path).await?;
        let mut reader = CipherReader::open(&self.cipher, &mut file, METADATA_LABEL).await?;

        let result = read_sections(&mut reader).await;
        let closed = reader.close();

        let loaded = match result {
            Ok(loaded) => {
                closed?;
                loaded
            }
            Err(err) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "close failed after metadata read error");
                }
                return Err(err.into());
            }
        };

        self.groups.extend(loaded.groups);
        self.users.extend(loaded.users);
        self.dirents.extend(loaded.dirents);
        self.versions = loaded.versions;
        info!(
            path = %self.path.display(),
            groups = self.groups.len(),
            users = self.users.len(),
            dirents = self.dirents.len(),
            "metadata loaded"
        );
        Ok(())
    }

    /// Write all registries to the metadata file.
    /// Overwrites go through a temp file and a rename so a failed save keeps
    /// the previous file intact.
    pub async fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let written = match self.write_file(&temp_path).await {
            Ok(()) => fs::rename(&temp_path, &self.path).await.map_err(StoreError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Err(rm_err) = fs::remove_file(&temp_path).await {
                debug!(error = %rm_err, "could not remove temp metadata file");
            }
            return Err(err);
        }
        self.sync_parent().await?;

        info!(
            path = %self.path.display(),
            groups = self.groups.len(),
            users = self.users.len(),
            dirents = self.dirents.len(),
            "metadata saved"
        );
        Ok(())
    }

    async fn write_file(&self, path: &Path) -> Result<(), StoreError> {
        let file = fs::File::create(path).await?;
        let mut writer = CipherWriter::new(self.cipher.clone(), file, METADATA_LABEL);

        metadata::write_section(&self.groups, self.versions.groups, &mut writer).await?;
        metadata::write_section(&self.users, self.versions.users, &mut writer).await?;
        metadata::write_section(&self.dirents, self.versions.dirents, &mut writer).await?;

        let file = writer.close().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Persist the rename itself. Directories cannot be opened for syncing on
    /// every platform, so this is Unix only.
    #[cfg(unix)]
    async fn sync_parent(&self) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::File::open(parent).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_parent(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Seed an empty store with the root user, root group and root directory.
    /// Returns false (and changes nothing) if any registry is non-empty.
    pub fn init_root(&mut self) -> Result<bool, StoreError> {
        if !self.users.is_empty() || !self.groups.is_empty() || !self.dirents.is_empty() {
            return Ok(false);
        }

        let versions = SectionVersions {
            groups: next_version(self.versions.groups, Group::KIND)?,
            users: next_version(self.versions.users, User::KIND)?,
            dirents: next_version(self.versions.dirents, Dirent::KIND)?,
        };

        self.users.insert(ROOT_USER, User::new(ROOT_USER, "root"));

        let mut group = Group::new(ROOT_GROUP, "root", ROOT_USER);
        group.add_member(ROOT_USER);
        self.groups.insert(ROOT_GROUP, group);

        self.dirents.insert(
            ROOT_DIRENT,
            Dirent {
                id: ROOT_DIRENT,
                parent: None,
                name: "/".to_string(),
                kind: DirentKind::Directory,
                owner: ROOT_USER,
                group: ROOT_GROUP,
                permissions: Permissions::from_mode(0o755),
            },
        );

        self.versions = versions;
        Ok(true)
    }

    pub fn add_user(&mut self, name: impl Into<String>) -> Result<UserId, StoreError> {
        let id = match self.users.keys().max() {
            Some(max) => UserId(max.0.checked_add(1).ok_or(StoreError::IdSpaceExhausted {
                kind: User::KIND,
            })?),
            None => ROOT_USER,
        };
        let version = next_version(self.versions.users, User::KIND)?;

        self.users.insert(id, User::new(id, name));
        self.versions.users = version;
        Ok(id)
    }

    /// The owner is added as the group's first member.
    pub fn add_group(
        &mut self,
        name: impl Into<String>,
        owner: UserId,
    ) -> Result<GroupId, StoreError> {
        if !self.users.contains_key(&owner) {
            return Err(StoreError::UnknownUser(owner));
        }

        let id = match self.groups.keys().max() {
            Some(max) => GroupId(max.0.checked_add(1).ok_or(StoreError::IdSpaceExhausted {
                kind: Group::KIND,
            })?),
            None => ROOT_GROUP,
        };
        let version = next_version(self.versions.groups, Group::KIND)?;

        let mut group = Group::new(id, name, owner);
        group.add_member(owner);
        self.groups.insert(id, group);
        self.versions.groups = version;
        Ok(id)
    }

    /// Returns false if the user was already a member.
    pub fn add_member(&mut self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        if !self.users.contains_key(&user) {
            return Err(StoreError::UnknownUser(user));
        }

        let entry = self
            .groups
            .get_mut(&group)
            .ok_or(StoreError::UnknownGroup(group))?;
        if entry.is_member(user) {
            return Ok(false);
        }

        let version = next_version(self.versions.groups, Group::KIND)?;
        entry.add_member(user);
        self.versions.groups = version;
        Ok(true)
    }

    /// Create a dirent under `parent` on behalf of `user`.
    /// The new entry is owned by `user` and inherits the parent's group.
    pub fn create_dirent(
        &mut self,
        user: UserId,
        parent: DirentId,
        name: impl Into<String>,
        kind: DirentKind,
        permissions: Permissions,
    ) -> Result<DirentId, StoreError> {
        if !self.users.contains_key(&user) {
            return Err(StoreError::UnknownUser(user));
        }

        let parent_entry = self.lookup(parent)?;
        if !parent_entry.is_dir() {
            return Err(StoreError::NotADirectory(parent));
        }
        permissions::check_create(user, parent_entry, &self.groups)?;
        let group = parent_entry.group;

        let id = match self.dirents.keys().max() {
            Some(max) => DirentId(max.0.checked_add(1).ok_or(StoreError::IdSpaceExhausted {
                kind: Dirent::KIND,
            })?),
            None => ROOT_DIRENT,
        };
        let version = next_version(self.versions.dirents, Dirent::KIND)?;

        self.dirents.insert(
            id,
            Dirent {
                id,
                parent: Some(parent),
                name: name.into(),
                kind,
                owner: user,
                group,
                permissions,
            },
        );
        self.versions.dirents = version;
        debug!(%user, %parent, dirent = %id, "dirent created");
        Ok(id)
    }

    pub fn check_create(&self, user: UserId, parent: DirentId) -> Result<(), StoreError> {
        permissions::check_create(user, self.lookup(parent)?, &self.groups)?;
        Ok(())
    }

    pub fn check_update(&self, user: UserId, target: DirentId) -> Result<(), StoreError> {
        permissions::check_update(user, self.lookup(target)?, &self.groups)?;
        Ok(())
    }

    pub fn check_read(&self, user: UserId, target: DirentId) -> Result<(), StoreError> {
        permissions::check_read(user, self.lookup(target)?, &self.groups)?;
        Ok(())
    }

    fn lookup(&self, id: DirentId) -> Result<&Dirent, StoreError> {
        self.dirents.get(&id).ok_or(StoreError::UnknownDirent(id))
    }
}

/// Registries and versions parsed from one metadata file.
struct LoadedSections {
    groups: GroupRegistry,
    users: UserRegistry,
    dirents: DirentTable,
    versions: SectionVersions,
}

async fn read_sections(reader: &mut CipherReader) -> Result<LoadedSections, MetadataError> {
    let mut lines = reader.lines();

    let mut groups = GroupRegistry::new();
    let mut users = UserRegistry::new();
    let mut dirents = DirentTable::new();
    let versions = SectionVersions {
        groups: metadata::read_section_with_lines(&mut groups, &mut lines).await?,
        users: metadata::read_section_with_lines(&mut users, &mut lines).await?,
        dirents: metadata::read_section_with_lines(&mut dirents, &mut lines).await?,
    };

    Ok(LoadedSections {
        groups,
        users,
        dirents,
        versions,
    })
}

fn next_version(current: i64, kind: &'static str) -> Result<i64, StoreError> {
    current
        .checked_add(1)
        .ok_or(StoreError::VersionOverflow { kind })
}
