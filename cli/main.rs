use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cryptmeta::config::Config;
use cryptmeta::dirent::{DirentId, DirentKind, Permissions};
use cryptmeta::identity::{GroupId, UserId};
use cryptmeta::key_manager::KeyManager;
use cryptmeta::store::MetadataStore;
use std::path::Path;
use tokio::fs;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// cryptmeta - administer the encrypted user, group and dirent metadata
#[derive(Parser)]
#[command(name = "cryptmeta")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create config, key and a metadata file seeded with root
    Init {
        /// Metadata file path
        #[arg(short, long, default_value = "./metadata.enc")]
        metadata_path: String,

        /// Key file path
        #[arg(short, long, default_value = "./cryptmeta.key")]
        key_path: String,
    },

    /// Register a user
    AddUser { name: String },

    /// Register a group owned by an existing user
    AddGroup {
        name: String,

        #[arg(short, long)]
        owner: u32,
    },

    /// Add a user to a group
    Join { group: u32, user: u32 },

    /// Create a directory as a given user
    Mkdir {
        /// Parent directory id
        parent: u64,

        name: String,

        /// Acting user id
        #[arg(short = 'u', long = "as")]
        as_user: u32,

        /// Octal mode, e.g. 755
        #[arg(short, long, default_value = "755")]
        mode: String,
    },

    /// Check whether a user may perform an operation on a dirent
    Check {
        op: Operation,
        dirent: u64,

        #[arg(short = 'u', long = "as")]
        as_user: u32,
    },

    /// Print all registries
    Show,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Operation {
    Read,
    Write,
    Create,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=info,cryptmeta=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "cryptmeta starting");

    match cli.command {
        Commands::Init {
            metadata_path,
            key_path,
        } => cmd_init(&cli.config, &metadata_path, &key_path).await,

        Commands::AddUser { name } => {
            let mut store = open_store(&cli.config).await?;
            let id = store.add_user(&name)?;
            store.save().await?;
            println!("Added user {} ({})", id, name);
            Ok(())
        }

        Commands::AddGroup { name, owner } => {
            let mut store = open_store(&cli.config).await?;
            let id = store.add_group(&name, UserId(owner))?;
            store.save().await?;
            println!("Added group {} ({})", id, name);
            Ok(())
        }

        Commands::Join { group, user } => {
            let mut store = open_store(&cli.config).await?;
            if store.add_member(GroupId(group), UserId(user))? {
                store.save().await?;
                println!("User {} joined group {}", user, group);
            } else {
                println!("User {} is already in group {}", user, group);
            }
            Ok(())
        }

        Commands::Mkdir {
            parent,
            name,
            as_user,
            mode,
        } => {
            let mode = u32::from_str_radix(&mode, 8)
                .with_context(|| format!("invalid octal mode '{}'", mode))?;
            let mut store = open_store(&cli.config).await?;
            let id = store.create_dirent(
                UserId(as_user),
                DirentId(parent),
                &name,
                DirentKind::Directory,
                Permissions::from_mode(mode),
            )?;
            store.save().await?;
            println!("Created directory {} ({})", id, name);
            Ok(())
        }

        Commands::Check { op, dirent, as_user } => {
            let store = open_store(&cli.config).await?;
            let user = UserId(as_user);
            let target = DirentId(dirent);
            match op {
                Operation::Read => store.check_read(user, target)?,
                Operation::Write => store.check_update(user, target)?,
                Operation::Create => store.check_create(user, target)?,
            }
            println!("allowed");
            Ok(())
        }

        Commands::Show => {
            let store = open_store(&cli.config).await?;
            cmd_show(&store);
            Ok(())
        }
    }
}

async fn open_store(config_path: &str) -> Result<MetadataStore> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let km = KeyManager::load_or_generate(&cfg.key_path).await?;
    let store = MetadataStore::open(&km, &cfg.metadata_path)
        .await
        .with_context(|| format!("loading metadata from {}", cfg.metadata_path))?;
    Ok(store)
}

async fn cmd_init(config_path: &str, metadata_path: &str, key_path: &str) -> Result<()> {
    let cfg = Config::new(key_path, metadata_path);
    cfg.validate()?;

    for existing in [config_path, key_path, metadata_path] {
        if fs::try_exists(existing).await.unwrap_or(false) {
            bail!(
                "'{}' already exists. Remove it first or use a different path.",
                existing
            );
        }
    }

    let km = KeyManager::load_or_generate(&cfg.key_path).await?;
    let mut store = MetadataStore::new(&km, Path::new(&cfg.metadata_path));
    store.init_root()?;
    store.save().await?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:   {}", config_path);
    println!("Key:      {}", key_path);
    println!("Metadata: {}", metadata_path);
    println!();
    println!("IMPORTANT: Keep your key file secure and backed up!");
    Ok(())
}

fn cmd_show(store: &MetadataStore) {
    let versions = store.versions();

    let mut users: Vec<_> = store.users().values().collect();
    users.sort_by_key(|u| u.id);
    println!("Users (version {}):", versions.users);
    for user in users {
        println!("  {:>5}  {}", user.id, user.name);
    }

    let mut groups: Vec<_> = store.groups().values().collect();
    groups.sort_by_key(|g| g.id);
    println!("Groups (version {}):", versions.groups);
    for group in groups {
        let members: Vec<String> = group.members.iter().map(|m| m.to_string()).collect();
        println!(
            "  {:>5}  {:<16} owner={} members=[{}]",
            group.id,
            group.name,
            group.owner,
            members.join(",")
        );
    }

    let mut dirents: Vec<_> = store.dirents().values().collect();
    dirents.sort_by_key(|d| d.id);
    println!("Dirents (version {}):", versions.dirents);
    for d in dirents {
        let parent = d.parent.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>5}  {} {:>5}:{:<5} parent={:<5} {}",
            d.id, d.permissions, d.owner, d.group, parent, d.name
        );
    }
}
