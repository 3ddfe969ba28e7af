// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLFS FUSE Host: mounts a filesystem stored in SQL tables
//!
//! `mount` serves a provisioned store through libfuse; `migrate` applies or
//! rolls back the schema.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod dispatch;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod mapping;

#[cfg(all(feature = "fuse", target_os = "linux"))]
use adapter::SqlFsFuse;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sqlfs_core::schema::Direction;
use sqlfs_core::{Dsn, FsConfig, Migrator, StoreConfig};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sqlfs-fuse-host", version, about)]
struct Cli {
    /// Log filter (e.g. `info`, `sqlfs=debug`); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount a provisioned store
    Mount(MountArgs),
    /// Apply or roll back schema migrations
    Migrate(MigrateArgs),
    /// Unmount a mounted filesystem
    Unmount(UnmountArgs),
}

#[derive(Args, Debug)]
struct MountArgs {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Store to serve, e.g. sqlite:///var/lib/sqlfs.db?tblprefix=fs_
    dsn: Dsn,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// `up` or `down`
    direction: Direction,

    /// Store to migrate
    dsn: Dsn,

    /// Migrations to roll back when going down
    #[arg(long, default_value_t = 1, conflicts_with = "all")]
    down_number: usize,

    /// Roll back every migration when going down
    #[arg(long)]
    all: bool,
}

#[derive(Args, Debug)]
struct UnmountArgs {
    /// Mount point to detach
    mount_point: PathBuf,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<FsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)?;
            let config: FsConfig = serde_json::from_str(&content)?;
            Ok(config)
        }
        None => Ok(FsConfig::default()),
    }
}

fn migrate(args: MigrateArgs) -> Result<()> {
    let executor = sqlfs_core::connect(&args.dsn, &StoreConfig::default())?;
    let migrator = Migrator::new(executor);
    let count = if args.all { None } else { Some(args.down_number) };
    let applied = migrator.run(args.direction, count)?;
    info!(direction = %args.direction, count = applied, "Migrations finished");
    Ok(())
}

fn mount(args: MountArgs) -> Result<()> {
    info!("Starting SQLFS FUSE Host");
    info!("Mount point: {}", args.mount_point.display());

    let config = load_config(args.config)?;
    info!("Configuration loaded: {:?}", config);
    info!(
        "Mount options: allow_other={} allow_root={} auto_unmount={}",
        args.allow_other, args.allow_root, args.auto_unmount
    );
    let executor = sqlfs_core::connect(&args.dsn, &config.store)?;

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let filesystem = SqlFsFuse::new(executor, &config)?;

        let mut mount_options = vec![
            fuser::MountOption::FSName("sqlfs".to_string()),
            fuser::MountOption::Subtype("sqlfs".to_string()),
        ];

        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }

        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }

        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("Mounting filesystem...");
        let session = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)?;
        info!("SQLFS FUSE host mounted; blocking until unmount");
        session.join();
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        let root = sqlfs_core::NodeAdapter::new(executor).root()?;
        tracing::warn!("FUSE support not compiled in. This binary is for testing only.");
        info!("Store {} opened, root inode {}", args.dsn, root.inode());
        info!("To enable FUSE support, compile with: cargo build --features fuse");
    }

    Ok(())
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn run_umount(binary: &str, base_args: &[&str], mount_point: &std::path::Path) -> Result<()> {
    let output = std::process::Command::new(binary)
        .args(base_args)
        .arg(mount_point)
        .output()
        .map_err(|err| anyhow::anyhow!("failed to run {binary}: {err}"))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    anyhow::bail!("{binary} {} failed: {}", mount_point.display(), stderr.trim())
}

fn unmount(args: UnmountArgs) -> Result<()> {
    info!("Unmounting {}", args.mount_point.display());

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        if let Err(err) = run_umount("fusermount", &["-u"], &args.mount_point) {
            tracing::warn!("{err}; falling back to umount");
            run_umount("umount", &[], &args.mount_point)?;
        }
        info!("Unmounted {}", args.mount_point.display());
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        tracing::warn!("FUSE support not compiled in. Nothing was unmounted.");
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Command::Mount(args) => mount(args),
        Command::Migrate(args) => migrate(args),
        Command::Unmount(args) => unmount(args),
    }
}
