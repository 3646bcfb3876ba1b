//! CloudSync CLI
//!
//! Command-line access to the save and backup contract.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudsync::config::CloudSyncConfig;
use cloudsync::local::LocalSaves;
use cloudsync::{open_store, CloudClient, Provider, Staleness};

#[derive(Parser)]
#[command(name = "cloudsync")]
#[command(about = "Sync game saves with Dropbox or Google Drive")]
#[command(version)]
struct Cli {
    /// Remote provider (dropbox, drive, memory)
    #[arg(short, long, env = "CLOUDSYNC_PROVIDER", default_value = "dropbox")]
    provider: Provider,

    /// Configuration file
    #[arg(short, long, env = "CLOUDSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Local saves root
    #[arg(long, env = "CLOUDSYNC_SAVES_DIR")]
    saves_dir: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cloud saves
    Saves,
    /// List local saves
    Local,
    /// Upload a local save
    Upload {
        /// Save folder name
        name: String,
        /// Back up, delete and re-upload the cloud copy
        #[arg(long)]
        replace: bool,
        /// With --replace, skip the backup step
        #[arg(long, requires = "replace")]
        no_backup: bool,
        /// Upload even if the cloud copy has more days played
        #[arg(long)]
        force: bool,
    },
    /// Download a cloud save
    Download {
        name: String,
        /// Destination parent directory
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
    },
    /// Replace the local save with its cloud copy
    Restore {
        name: String,
        /// Restore even if the local copy has more days played
        #[arg(long)]
        force: bool,
    },
    /// Delete a cloud save
    DeleteSave { name: String },
    /// List backups
    Backups,
    /// Back up a cloud save
    Backup { name: String },
    /// Delete a backup
    DeleteBackup { cloud_folder_name: String },
    /// Download a backup
    DownloadBackup {
        cloud_folder_name: String,
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
    },
    /// Delete old backups
    Purge {
        /// Backups to keep per save (defaults to the configured value)
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config_path = cli
        .config
        .clone()
        .or_else(CloudSyncConfig::default_path)
        .context("Could not determine a configuration path")?;
    let mut config = CloudSyncConfig::load(&config_path)?.with_env_overrides();
    if let Some(dir) = cli.saves_dir.clone() {
        config.saves_dir = Some(dir);
    }

    let saves_root = config
        .saves_path_or_default()
        .context("Could not determine the saves directory")?;
    let store = open_store(cli.provider, &config)?;
    let client = CloudClient::new(store, LocalSaves::with_json_reader(saves_root));

    if !client.is_authenticated() && !matches!(cli.command, Commands::Local) {
        bail!(
            "Not authenticated with {}: add credentials to {}",
            cli.provider,
            config_path.display()
        );
    }

    match cli.command {
        Commands::Saves => {
            let listing = client.get_saves().await?;
            for save in &listing.saves {
                println!(
                    "{}\t{}\t{} days",
                    save.folder_name,
                    save.display_name(),
                    save.days_played
                );
            }
            if listing.load_failed {
                eprintln!("Some cloud saves could not be read, see the log");
            }
        }

        Commands::Local => {
            let listing = client.local_saves()?;
            for save in &listing.saves {
                println!(
                    "{}\t{}\t{} days",
                    save.folder_name,
                    save.display_name(),
                    save.days_played
                );
            }
            if listing.load_failed {
                eprintln!("Some local saves could not be read, see the log");
            }
        }

        Commands::Upload {
            name,
            replace,
            no_backup,
            force,
        } => {
            if !force {
                if let Staleness::OtherIsNewer {
                    current_days,
                    incoming_days,
                } = client.upload_staleness(&name).await?
                {
                    bail!(
                        "Cloud copy of {} is further along ({} days vs {} local), use --force",
                        name,
                        current_days,
                        incoming_days
                    );
                }
            }

            if !replace {
                client.upload_save(&name).await?;
            } else if no_backup {
                client.replace_save_without_backup(&name).await?;
            } else {
                client.replace_save(&name, &config.settings).await?;
            }
            println!("Uploaded {}", name);
        }

        Commands::Download { name, dest } => {
            client.download_save(&name, &dest).await?;
            println!("Downloaded {} to {}", name, dest.join(&name).display());
        }

        Commands::Restore { name, force } => {
            if !force {
                if let Staleness::OtherIsNewer {
                    current_days,
                    incoming_days,
                } = client.download_staleness(&name).await?
                {
                    bail!(
                        "Local copy of {} is further along ({} days vs {} in the cloud), use --force",
                        name,
                        current_days,
                        incoming_days
                    );
                }
            }
            client.restore_save(&name).await?;
            println!("Restored {}", name);
        }

        Commands::DeleteSave { name } => {
            client.delete_save(&name).await?;
            println!("Deleted {}", name);
        }

        Commands::Backups => {
            for backup in client.get_backups().await? {
                println!(
                    "{}\t{}\t{}",
                    backup.folder_name,
                    backup.timestamp.to_rfc3339(),
                    backup.cloud_folder_name
                );
            }
        }

        Commands::Backup { name } => match client.backup_save(&name).await? {
            Some(cloud_name) => println!("Created backup {}", cloud_name),
            None => println!("No cloud save named {}, nothing to back up", name),
        },

        Commands::DeleteBackup { cloud_folder_name } => {
            client.delete_backup(&cloud_folder_name).await?;
            println!("Deleted backup {}", cloud_folder_name);
        }

        Commands::DownloadBackup {
            cloud_folder_name,
            dest,
        } => {
            client.download_backup(&cloud_folder_name, &dest).await?;
            println!(
                "Downloaded {} to {}",
                cloud_folder_name,
                dest.join(&cloud_folder_name).display()
            );
        }

        Commands::Purge { keep } => {
            let keep = keep.unwrap_or(config.settings.backups_to_keep);
            let report = client.purge_backups(keep).await;
            println!(
                "Deleted {} backups, kept {}, {} failed",
                report.deleted.len(),
                report.kept,
                report.failed.len()
            );
            for (name, reason) in &report.failed {
                eprintln!("  {}: {}", name, reason);
            }
        }
    }

    Ok(())
}
