//! CLI command definitions and argument parsing

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};

use relup_core::keys::KeyRecords;
use relup_core::AppConfig;

use crate::repo::Repository;

/// Largest number of keys `keys make` creates at once.
pub const MAX_KEYS_PER_CALL: u64 = 10;

/// relup - package, patch, and sign application releases
#[derive(Parser, Debug)]
#[command(name = "relup")]
#[command(version, about = "relup - package, patch, and sign application releases")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Repository root (defaults to the current directory)
    #[arg(long, global = true, env = "RELUP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a repository: directories, keys, and client config
    Init(InitArgs),
    /// Manage signing keys
    Keys(KeysArgs),
    /// Process release archives
    Pkg(PkgArgs),
    /// Sign the version manifest and write versions.gz
    Sign,
}

/// Arguments for the init command
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Application name, matching archive name prefixes
    #[arg(long)]
    pub app_name: String,

    /// Company name
    #[arg(long, default_value = "")]
    pub company: String,

    /// Update URL (can be specified multiple times)
    #[arg(long = "url")]
    pub urls: Vec<String>,

    /// Do not generate binary patches
    #[arg(long)]
    pub no_patches: bool,
}

/// Arguments for the keys command
#[derive(Args, Debug)]
pub struct KeysArgs {
    #[command(subcommand)]
    pub command: KeysCommands,
}

#[derive(Subcommand, Debug)]
pub enum KeysCommands {
    /// Create new signing keys
    Make {
        /// Number of keys to create
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..=MAX_KEYS_PER_CALL))]
        count: u64,
    },
    /// Revoke the oldest active keys and replace them
    Revoke {
        /// Number of keys to revoke
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        count: u64,
    },
    /// List active keys
    Show,
}

/// Arguments for the pkg command
#[derive(Args, Debug)]
pub struct PkgArgs {
    #[command(subcommand)]
    pub command: PkgCommands,
}

#[derive(Subcommand, Debug)]
pub enum PkgCommands {
    /// Add archives in relup-data/new to the manifest and build patches
    Process,
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        let root = match self.data_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let repo = Repository::open(&root)?;

        match self.command {
            Commands::Init(args) => args.execute(&repo),
            Commands::Keys(args) => args.execute(&repo),
            Commands::Pkg(args) => args.execute(&repo),
            Commands::Sign => {
                let count = repo.sign()?;
                println!(
                    "Signed manifest with {count} keys: {}",
                    repo.key_manager().deploy_dir().join(relup_core::VERSION_FILE).display()
                );
                Ok(())
            }
        }
    }
}

impl InitArgs {
    pub fn execute(self, repo: &Repository) -> anyhow::Result<()> {
        let config = AppConfig {
            app_name: self.app_name,
            company_name: self.company,
            update_urls: self.urls,
            patch_support: !self.no_patches,
            ..Default::default()
        };
        if repo.init(config)? {
            println!("Initialized repository at {}", repo.dirs().root.display());
            println!("Client config: {}", repo.client_config_path().display());
        } else {
            println!("Repository already initialized at {}", repo.dirs().root.display());
        }
        Ok(())
    }
}

impl KeysArgs {
    pub fn execute(self, repo: &Repository) -> anyhow::Result<()> {
        match self.command {
            KeysCommands::Make { count } => {
                let ids = repo.make_keys(count as usize)?;
                println!("Created {} keys: {:?}", ids.len(), ids);
            }
            KeysCommands::Revoke { count } => {
                let revoked = repo.revoke_keys(count as usize)?;
                println!("Revoked keys: {:?}", revoked);
            }
            KeysCommands::Show => {
                println!("{}", active_key_table(&repo.key_manager().records()));
            }
        }
        Ok(())
    }
}

/// Table of the keys that still sign; revoked keys are left out.
fn active_key_table(records: &KeyRecords) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Created At", "Public Key"]);
    for (id, record) in records.iter().filter(|(_, record)| !record.is_revoked()) {
        table.add_row(vec![
            id.to_string(),
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            record.public.clone(),
        ]);
    }
    table
}

impl PkgArgs {
    pub fn execute(self, repo: &Repository) -> anyhow::Result<()> {
        match self.command {
            PkgCommands::Process => {
                let report = repo.process_packages()?;

                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Name", "Platform", "Version", "Patch"]);
                for artifact in &report.artifacts {
                    table.add_row(vec![
                        artifact.name.clone(),
                        artifact.platform.clone(),
                        artifact.version.to_string(),
                        artifact.patch_name.clone().unwrap_or_else(|| "-".to_string()),
                    ]);
                }
                println!("{table}");

                for rejected in &report.rejected {
                    eprintln!("Skipped {rejected}");
                }
            }
        }
        Ok(())
    }
}
