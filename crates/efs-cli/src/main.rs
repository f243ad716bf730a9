//! `efs-tools`: manage password-protected encrypted directories from the shell.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use efs_core::{
    config::EfsConfig, logging, migration, DataMigration, EfsError, LifecycleState,
    StorageService, TreeMigrator, UnmountOutcome,
};
use efs_kernel::{SystemKeyring, SystemMountProvider};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde::Serialize;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

type SystemService = StorageService<SystemKeyring, SystemMountProvider, TreeMigrator>;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "efs-tools",
    version,
    about = "Create, unlock and retire password-protected encrypted directories."
)]
struct Cli {
    /// Path to the EFS configuration file (defaults to $EFS_CONFIG or /etc/efs/efs.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lifecycle operations on a single encrypted directory.
    Storage {
        #[command(subcommand)]
        command: StorageCommands,
    },

    /// Directory helpers used around encryption.
    Utils {
        #[command(subcommand)]
        command: UtilsCommands,
    },

    /// Validate a configuration file or print its JSON schema.
    Validate {
        /// Configuration file to check; defaults to the active config path.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Print the JSON schema instead of validating.
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Subcommand, Debug)]
enum StorageCommands {
    /// Encrypt an existing directory in place.
    Create {
        path: PathBuf,
        /// Password; prompted for when omitted.
        password: Option<String>,
    },

    /// Mount the decrypted view of a directory.
    Unlock {
        path: PathBuf,
        password: Option<String>,
    },

    /// Unmount the decrypted view of a directory.
    Lock { path: PathBuf },

    /// Re-wrap the directory keys under a new password.
    #[command(alias = "change_passwd")]
    ChangePassword {
        path: PathBuf,
        old_password: Option<String>,
        new_password: Option<String>,
    },

    /// Delete the encrypted content and key record without decrypting.
    Remove { path: PathBuf },

    /// Decrypt the content back into place and remove the encryption.
    Restore {
        path: PathBuf,
        password: Option<String>,
    },

    /// Show the lifecycle state of a directory.
    Stat {
        path: PathBuf,
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UtilsCommands {
    /// Print the apparent size in bytes of a directory tree.
    Size { path: PathBuf },

    /// Copy directory content preserving ownership, mode, label and times.
    Cp { src: PathBuf, dst: PathBuf },

    /// Remove everything below a directory.
    Rm { path: PathBuf },
}

#[derive(Serialize)]
struct StatReport {
    path: PathBuf,
    state: LifecycleState,
    unlocked: bool,
    lower_dir: PathBuf,
    key_record: PathBuf,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        let code = err.downcast_ref::<EfsError>().map_or(1, EfsError::code);
        std::process::exit(code);
    }
}

fn load_cli_config(path: Option<PathBuf>) -> Result<EfsConfig> {
    let path = path.unwrap_or_else(EfsConfig::default_path);
    EfsConfig::load_or_default(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn build_service(config: EfsConfig) -> SystemService {
    let mounts = SystemMountProvider::from_config(&config);
    let migrator = TreeMigrator::from_config(&config.migration);
    StorageService::new(Arc::new(config), SystemKeyring, mounts, migrator)
}

fn password_arg(given: Option<String>, prompt: &str) -> Result<Zeroizing<String>> {
    match given {
        Some(value) => Ok(Zeroizing::new(value)),
        None => Ok(Zeroizing::new(
            prompt_password(prompt).context("failed to read password")?,
        )),
    }
}

fn new_password_arg(given: Option<String>, prompt: &str) -> Result<Zeroizing<String>> {
    if given.is_some() {
        return password_arg(given, prompt);
    }
    let first = password_arg(None, prompt)?;
    let confirm = password_arg(None, "Confirm password: ")?;
    if *first != *confirm {
        bail!("passwords do not match");
    }
    Ok(first)
}

/// Dispatch to the requested subcommand.
fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Storage { command } => {
            let service = build_service(load_cli_config(cli.config)?);
            run_storage(&service, command)
        }
        Commands::Utils { command } => run_utils(load_cli_config(cli.config)?, command),
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(EfsConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let path = file.or(cli.config).unwrap_or_else(EfsConfig::default_path);
            let cfg = EfsConfig::load(&path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;
            let issues = cfg.validate();
            if !issues.is_empty() {
                for issue in &issues {
                    eprintln!("- {issue}");
                }
                bail!("{} configuration issue(s) found", issues.len());
            }
            println!("Configuration {} is valid.", path.display());
            Ok(())
        }
    }
}

fn run_storage(service: &SystemService, command: StorageCommands) -> Result<()> {
    match command {
        StorageCommands::Create { path, password } => {
            let password = new_password_arg(password, "New password: ")?;
            service.create(&path, &password)?;
            println!("Encrypted {}.", path.display());
        }
        StorageCommands::Unlock { path, password } => {
            let password = password_arg(password, "Password: ")?;
            service.unlock(&path, &password)?;
            println!("Unlocked {}.", path.display());
        }
        StorageCommands::Lock { path } => match service.lock(&path)? {
            UnmountOutcome::NotMounted => println!("{} was not unlocked.", path.display()),
            UnmountOutcome::Unmounted { key_failures } => {
                for failure in &key_failures {
                    warn!("key left in keyring: {failure}");
                }
                println!("Locked {}.", path.display());
            }
        },
        StorageCommands::ChangePassword {
            path,
            old_password,
            new_password,
        } => {
            let old_password = password_arg(old_password, "Current password: ")?;
            let new_password = new_password_arg(new_password, "New password: ")?;
            service.change_password(&path, &old_password, &new_password)?;
            println!("Password changed for {}.", path.display());
        }
        StorageCommands::Remove { path } => {
            service.remove(&path)?;
            println!("Removed encrypted storage for {}.", path.display());
        }
        StorageCommands::Restore { path, password } => {
            let password = password_arg(password, "Password: ")?;
            service.recover_and_remove(&path, &password)?;
            println!(
                "Restored {} ({} bytes copied).",
                path.display(),
                service.progress().bytes()
            );
        }
        StorageCommands::Stat { path, json } => print_stat(service, &path, json)?,
    }
    Ok(())
}

fn print_stat(service: &SystemService, path: &Path, json: bool) -> Result<()> {
    let state = service.get_status(path)?;
    let paths = service.paths(path)?;
    let report = StatReport {
        unlocked: service.is_unlocked(&paths.storage)?,
        path: paths.storage,
        state,
        lower_dir: paths.lower,
        key_record: paths.key_record,
    };

    if json {
        println!("{}", to_string_pretty(&report)?);
    } else {
        println!("path:       {}", report.path.display());
        println!("state:      {}", report.state);
        println!("unlocked:   {}", if report.unlocked { "yes" } else { "no" });
        println!("lower dir:  {}", report.lower_dir.display());
        println!("key record: {}", report.key_record.display());
    }
    Ok(())
}

fn run_utils(config: EfsConfig, command: UtilsCommands) -> Result<()> {
    let migrator = TreeMigrator::from_config(&config.migration);
    match command {
        UtilsCommands::Size { path } => {
            println!("{}", migration::dir_size(&path)?);
        }
        UtilsCommands::Cp { src, dst } => {
            if !dst.is_dir() {
                bail!("destination {} is not a directory", dst.display());
            }
            migrator.copy_dir_content(&src, &dst)?;
            println!(
                "Copied {} bytes from {} to {}.",
                migrator.progress().bytes(),
                src.display(),
                dst.display()
            );
        }
        UtilsCommands::Rm { path } => {
            migrator.remove_dir_content(&path)?;
            println!("Removed content of {}.", path.display());
        }
    }
    Ok(())
}
