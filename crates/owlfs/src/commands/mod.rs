pub mod serve;

use anyhow::Result;
use owlfs_sftp::Config;
use std::path::Path;

pub fn init_config(path: &Path) -> Result<()> {
    crate::config::save_config(path, &Config::default())?;
    println!("Configuration file created at: {}", path.display());
    println!("\nSet an authentication method before starting the server.");
    Ok(())
}
