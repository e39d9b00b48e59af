//! Subcommands that run without the daemon: config loading and `status`.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::network::{AddressPool, Cidr, PersistedPool};

/// Load the config file (or defaults) and apply environment overrides.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

/// Run `fragrant status`: print the persisted pool without touching it.
pub fn run_status(config: &Config) -> Result<()> {
    let pool_file = &config.network.address_file;

    if !pool_file.exists() {
        println!("No pool file at {}", pool_file.display());
        println!("No addresses have been claimed yet (range {}).", config.network.address_range);
        return Ok(());
    }

    let modified_ago = std::fs::metadata(pool_file)
        .and_then(|meta| meta.modified())
        .map(|mtime| format_duration(mtime.elapsed().unwrap_or_default()))
        .unwrap_or_else(|_| "unknown".to_string());

    println!(
        "Pool file: {} (last modified: {})\n",
        pool_file.display(),
        modified_ago
    );

    let data = std::fs::read_to_string(pool_file)
        .with_context(|| format!("reading pool file: {}", pool_file.display()))?;
    let pool: PersistedPool = serde_json::from_str(&data)
        .with_context(|| format!("parsing pool file: {}", pool_file.display()))?;
    // Same consistency rules the service applies at startup.
    AddressPool::from_persisted(pool.clone())
        .with_context(|| format!("pool file is inconsistent: {}", pool_file.display()))?;

    if pool.address_range != config.network.address_range {
        println!(
            "Note: configured range {} differs from persisted range; the persisted one is used.\n",
            config.network.address_range
        );
    }
    print!("{}", render_pool(&pool));
    Ok(())
}

fn render_pool(pool: &PersistedPool) -> String {
    let capacity = pool
        .address_range
        .parse::<Cidr>()
        .map(|c| c.usable_count().to_string())
        .unwrap_or_else(|_| "?".to_string());

    let mut out = String::new();
    let _ = writeln!(out, "Range: {}", pool.address_range);
    let _ = writeln!(out, "Claimed: {} of {}", pool.allocated_addresses.len(), capacity);

    // Sort by address for readable output
    let mut entries: Vec<_> = pool.address_map.iter().collect();
    entries.sort_by_key(|(_, addr)| **addr);
    for (id, addr) in entries {
        let _ = writeln!(out, "  {:<15}  {}", addr.to_string(), id);
    }
    out
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}
