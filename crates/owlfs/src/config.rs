use crate::SftpArgs;
use anyhow::{Context, Result};
use owlfs_sftp::Config;
use std::path::Path;

/// Build the server configuration: file values first, then flag overrides
pub fn load_config(args: &SftpArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => Config::default(),
    };
    apply_overrides(&mut config, args);
    Ok(config)
}

fn apply_overrides(config: &mut Config, args: &SftpArgs) {
    if let Some(addr) = &args.addr {
        config.listen_addr = addr.clone();
    }
    if let Some(key) = &args.key {
        config.host_key = Some(key.clone());
    }
    if let Some(keys) = &args.authorized_keys {
        config.authorized_keys = Some(keys.clone());
    }
    if let Some(user) = &args.user {
        config.user = Some(user.clone());
    }
    if let Some(pass) = &args.pass {
        config.pass = Some(pass.clone());
    }
    if args.no_auth {
        config.no_auth = true;
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(file) = &args.log_file {
        config.logging.file = Some(file.clone());
    }
}

pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("Failed to serialize configuration")?;
    std::fs::write(path, contents).context("Failed to write configuration file")?;
    Ok(())
}
