mod commands;
mod config;
mod logging;

use clap::{Args, Parser, Subcommand};
use owlfs_sftp::LogFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "owlfs")]
#[command(about = "Serve virtual filesystems over network protocols", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a filesystem
    #[command(subcommand)]
    Serve(ServeCommands),

    /// Write a configuration file with every default spelled out
    InitConfig {
        /// Where to write the file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum ServeCommands {
    /// Serve over SFTP
    Sftp(SftpArgs),
}

#[derive(Args, Debug)]
pub struct SftpArgs {
    /// Directory to serve
    #[arg(required_unless_present = "memory")]
    root: Option<PathBuf>,

    /// Serve an empty in-memory filesystem instead of a directory
    #[arg(long, conflicts_with = "root")]
    memory: bool,

    /// Capacity of the in-memory filesystem in bytes (reported by `df`)
    #[arg(long, requires = "memory")]
    capacity: Option<u64>,

    /// Configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IPaddress:Port to listen on
    #[arg(long)]
    addr: Option<String>,

    /// SSH host key file; generated and cached when unset
    #[arg(long)]
    key: Option<PathBuf>,

    /// Authorized keys file for public key authentication
    #[arg(long)]
    authorized_keys: Option<PathBuf>,

    /// User name for password authentication
    #[arg(long)]
    user: Option<String>,

    /// Password for password authentication
    #[arg(long)]
    pass: Option<String>,

    /// Accept every client without authentication
    #[arg(long)]
    no_auth: bool,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file, rotated daily
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(ServeCommands::Sftp(args)) => commands::serve::sftp(args).await,
        Commands::InitConfig { path } => commands::init_config(&path),
    }
}
