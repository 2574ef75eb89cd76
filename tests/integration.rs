use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use cryptmeta::cipherio::{CipherReader, CipherWriter, ReadSeekClose};
use cryptmeta::dirent::{Access, DirentKind, Permissions};
use cryptmeta::identity::{Group, GroupId, User, UserId};
use cryptmeta::key_manager::KeyManager;
use cryptmeta::store::{MetadataStore, METADATA_LABEL, ROOT_DIRENT, ROOT_GROUP, ROOT_USER};
use cryptmeta::{metadata, MetadataError, PermissionsError, StoreError};

fn test_key() -> KeyManager {
    KeyManager::from_bytes([0x42u8; 32])
}

/// Helper to create a temp dir and the metadata path inside it
fn setup_test_env() -> Result<(TempDir, std::path::PathBuf)> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("meta").join("metadata.enc");
    Ok((tmp, path))
}

/// Names of leftover `.tmp` files next to the metadata file
fn temp_files(path: &std::path::Path) -> Result<Vec<std::ffi::OsString>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(path.parent().expect("parent"))? {
        let name = entry?.file_name();
        if name.to_string_lossy().ends_with(".tmp") {
            found.push(name);
        }
    }
    Ok(found)
}

/// Write an arbitrary plaintext as a sealed metadata file
async fn seal_plaintext(path: &std::path::Path, plaintext: &str) -> Result<()> {
    let mut sealed = Vec::new();
    test_key()
        .stream_cipher()
        .seal(plaintext.as_bytes(), &mut sealed, METADATA_LABEL)
        .await?;
    fs::create_dir_all(path.parent().expect("parent"))?;
    fs::write(path, sealed)?;
    Ok(())
}

#[tokio::test]
async fn store_save_and_reopen() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    let km = test_key();

    let mut store = MetadataStore::new(&km, &path);
    store.init_root()?;
    let alice = store.add_user("alice")?;
    let bob = store.add_user("bob")?;
    let staff = store.add_group("staff", alice)?;
    store.add_member(staff, bob)?;
    let home = store.create_dirent(
        ROOT_USER,
        ROOT_DIRENT,
        "home",
        DirentKind::Directory,
        Permissions::from_mode(0o777),
    )?;
    store.save().await?;

    let reopened = MetadataStore::open(&km, &path).await?;
    assert_eq!(reopened.users(), store.users());
    assert_eq!(reopened.groups(), store.groups());
    assert_eq!(reopened.dirents(), store.dirents());
    assert_eq!(reopened.versions(), store.versions());
    assert_eq!(reopened.dirent(home).map(|d| d.name.as_str()), Some("home"));

    // no temp file left behind
    assert!(temp_files(&path)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn metadata_file_is_encrypted() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    let km = test_key();

    let mut store = MetadataStore::new(&km, &path);
    store.init_root()?;
    store.add_user("a-very-recognizable-name")?;
    store.save().await?;

    let raw = fs::read(&path)?;
    let needle = b"a-very-recognizable-name";
    assert!(!raw.windows(needle.len()).any(|w| w == needle));

    // a different key cannot open it
    let other = KeyManager::from_bytes([0x24u8; 32]);
    let result = MetadataStore::open(&other, &path).await;
    assert!(matches!(result, Err(StoreError::Cipher(_))));
    Ok(())
}

#[tokio::test]
async fn load_is_additive() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    let km = test_key();

    let mut saved = MetadataStore::new(&km, &path);
    saved.init_root()?;
    saved.add_user("alice")?;
    saved.save().await?;

    // a store holding a stale alice and an extra user
    let mut store = MetadataStore::new(&km, &path);
    store.add_user("stale")?;
    store.add_user("stale alice")?;
    store.add_user("carol")?;
    store.load().await?;

    assert_eq!(store.user(UserId(0)).map(|u| u.name.as_str()), Some("root"));
    assert_eq!(store.user(UserId(1)).map(|u| u.name.as_str()), Some("alice"));
    assert_eq!(store.user(UserId(2)).map(|u| u.name.as_str()), Some("carol"));
    assert_eq!(store.users().len(), 3);
    Ok(())
}

#[tokio::test]
async fn permission_matrix_after_reload() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    let km = test_key();

    let mut store = MetadataStore::new(&km, &path);
    store.init_root()?;
    let owner = store.add_user("owner")?;
    let member = store.add_user("member")?;
    let stranger = store.add_user("stranger")?;
    store.add_member(ROOT_GROUP, member)?;

    let shared = store.create_dirent(
        ROOT_USER,
        ROOT_DIRENT,
        "shared",
        DirentKind::Directory,
        Permissions::from_mode(0o777),
    )?;
    // inherits the root group from /shared
    let file = store.create_dirent(
        owner,
        shared,
        "report.txt",
        DirentKind::File,
        Permissions::new(Access::READ_WRITE, Access::READ, Access::NONE),
    )?;
    let drop_box = store.create_dirent(
        ROOT_USER,
        ROOT_DIRENT,
        "drop-box",
        DirentKind::Directory,
        Permissions::new(Access::WRITE, Access::NONE, Access::NONE),
    )?;
    store.save().await?;

    let store = MetadataStore::open(&km, &path).await?;
    assert_eq!(store.dirent(file).map(|d| d.group), Some(ROOT_GROUP));

    assert!(store.check_read(owner, file).is_ok());
    assert!(store.check_update(owner, file).is_ok());

    assert!(store.check_read(member, file).is_ok());
    assert!(matches!(
        store.check_update(member, file),
        Err(StoreError::Permission(PermissionsError::Update { .. }))
    ));

    assert!(matches!(
        store.check_read(stranger, file),
        Err(StoreError::Permission(PermissionsError::Read { .. }))
    ));
    assert!(store.check_update(stranger, file).is_err());

    // only the drop-box owner may create inside it, members included
    assert!(store.check_create(ROOT_USER, drop_box).is_ok());
    for user in [owner, member, stranger] {
        let err = store.check_create(user, drop_box).unwrap_err();
        assert_eq!(
            err.as_permission(),
            Some(&PermissionsError::Create {
                user,
                parent: drop_box
            })
        );
    }
    Ok(())
}

#[tokio::test]
async fn truncated_section_in_file() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    seal_plaintext(
        &path,
        "{\"count\":5,\"version\":1}\n\
         {\"id\":1,\"name\":\"g1\",\"owner\":0}\n\
         {\"id\":2,\"name\":\"g2\",\"owner\":0}\n\
         {\"id\":3,\"name\":\"g3\",\"owner\":0}\n",
    )
    .await?;

    let result = MetadataStore::open(&test_key(), &path).await;
    match result {
        Err(StoreError::Metadata(MetadataError::Truncated {
            kind,
            read,
            expected,
        })) => {
            assert_eq!(kind, "groups");
            assert_eq!((read, expected), (3, 5));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("truncated section loaded"),
    }
    Ok(())
}

#[tokio::test]
async fn malformed_user_record_in_file() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    seal_plaintext(
        &path,
        "{\"count\":0,\"version\":1}\n\
         {\"count\":2,\"version\":1}\n\
         {\"id\":0,\"name\":\"root\"}\n\
         {\"id\":\"one\",\"name\":\"bad\"}\n\
         {\"count\":0,\"version\":1}\n",
    )
    .await?;

    let err = MetadataStore::open(&test_key(), &path)
        .await
        .err()
        .expect("malformed record must fail");
    match err {
        StoreError::Metadata(MetadataError::MalformedRecord {
            kind, index, raw, ..
        }) => {
            assert_eq!(kind, "users");
            assert_eq!(index, 1);
            assert_eq!(raw, "{\"id\":\"one\",\"name\":\"bad\"}");
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn failed_load_leaves_store_untouched() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    // valid groups section, broken users section
    seal_plaintext(
        &path,
        "{\"count\":1,\"version\":40}\n\
         {\"id\":5,\"name\":\"intruders\",\"owner\":0}\n\
         {\"count\":1,\"version\":41}\n\
         not json\n\
         {\"count\":0,\"version\":42}\n",
    )
    .await?;

    let mut store = MetadataStore::new(&test_key(), &path);
    store.init_root()?;
    store.add_user("alice")?;
    let groups = store.groups().clone();
    let users = store.users().clone();
    let versions = store.versions();

    let err = store.load().await.err().expect("broken users section");
    assert!(matches!(
        err,
        StoreError::Metadata(MetadataError::MalformedRecord { kind: "users", .. })
    ));
    assert_eq!(store.groups(), &groups);
    assert_eq!(store.users(), &users);
    assert_eq!(store.versions(), versions);
    assert!(store.group(GroupId(5)).is_none());
    Ok(())
}

#[tokio::test]
async fn exhausted_ids_and_versions_are_errors() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;

    // users version already at i64::MAX
    seal_plaintext(
        &path,
        "{\"count\":0,\"version\":1}\n\
         {\"count\":1,\"version\":9223372036854775807}\n\
         {\"id\":0,\"name\":\"root\"}\n\
         {\"count\":0,\"version\":1}\n",
    )
    .await?;
    let mut store = MetadataStore::open(&test_key(), &path).await?;
    assert!(matches!(
        store.add_user("next"),
        Err(StoreError::VersionOverflow { kind: "users" })
    ));
    assert_eq!(store.users().len(), 1);
    assert_eq!(store.versions().users, i64::MAX);

    // highest user id already at u32::MAX
    seal_plaintext(
        &path,
        "{\"count\":0,\"version\":1}\n\
         {\"count\":2,\"version\":1}\n\
         {\"id\":0,\"name\":\"root\"}\n\
         {\"id\":4294967295,\"name\":\"last\"}\n\
         {\"count\":0,\"version\":1}\n",
    )
    .await?;
    let mut store = MetadataStore::open(&test_key(), &path).await?;
    let err = store.add_user("next").unwrap_err();
    assert!(matches!(err, StoreError::IdSpaceExhausted { kind: "users" }));
    assert_eq!(err.to_string(), "users id space exhausted");
    assert_eq!(store.user(UserId(0)).map(|u| u.name.as_str()), Some("root"));
    assert_eq!(store.users().len(), 2);
    assert_eq!(store.versions().users, 1);
    Ok(())
}

#[tokio::test]
async fn failed_rename_removes_temp_file() -> Result<()> {
    let (_tmp, path) = setup_test_env()?;
    // a non-empty directory where the metadata file should go
    fs::create_dir_all(path.join("occupied"))?;

    let mut store = MetadataStore::new(&test_key(), &path);
    store.init_root()?;
    let result = store.save().await;

    assert!(matches!(result, Err(StoreError::Io(_))));
    assert!(temp_files(&path)?.is_empty());
    assert!(path.join("occupied").is_dir());
    Ok(())
}

#[tokio::test]
async fn sections_share_one_encrypted_stream() -> Result<()> {
    let cipher = test_key().stream_cipher();

    let mut group = Group::new(GroupId(4), "ops", UserId(1));
    group.add_member(UserId(2));
    let groups = HashMap::from([(group.id, group)]);
    let users = HashMap::from([
        (UserId(1), User::new(UserId(1), "alice")),
        (UserId(2), User::new(UserId(2), "bob")),
    ]);

    let mut writer = CipherWriter::new(cipher.clone(), Vec::new(), b"label".to_vec());
    metadata::write_section(&groups, 10, &mut writer).await?;
    metadata::write_section(&users, 11, &mut writer).await?;
    let sealed = writer.close().await?;

    let mut reader = CipherReader::open(&cipher, &mut Cursor::new(sealed), b"label").await?;

    let mut loaded_groups: HashMap<GroupId, Group> = HashMap::new();
    let mut loaded_users: HashMap<UserId, User> = HashMap::new();
    {
        let mut lines = BufReader::new(&mut reader).lines();
        let gv = metadata::read_section_with_lines(&mut loaded_groups, &mut lines).await?;
        let uv = metadata::read_section_with_lines(&mut loaded_users, &mut lines).await?;
        assert_eq!((gv, uv), (10, 11));
    }
    assert!(!reader.is_closed());
    assert_eq!(loaded_groups, groups);
    assert_eq!(loaded_users, users);

    // seek back and re-read the first section with the closing form
    reader.rewind().await?;
    let mut again: HashMap<GroupId, Group> = HashMap::new();
    let version = metadata::read_section(&mut again, &mut reader).await?;
    assert_eq!(version, 10);
    assert_eq!(again, groups);
    assert!(reader.is_closed());
    assert!(reader.close().is_err());
    Ok(())
}
