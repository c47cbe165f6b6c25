// dumpcheck/src/utils/mod.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;
use walkdir::WalkDir;
use which::which;

/// Resolves an executable: an explicitly configured path wins, otherwise `PATH` is searched.
pub fn find_executable(configured: Option<&Path>, name: &str) -> Result<PathBuf> {
    match configured {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => which(path).with_context(|| {
            format!("{} executable not found at configured path {}", name, path.display())
        }),
        None => which(name).with_context(|| {
            format!("{} executable not found in PATH. Please install it or set its path in config.json.", name)
        }),
    }
}

/// Turns `tcp://host:port` (also `ssl://`, `http://`, `https://`) into `host:port`.
pub fn endpoint_address(endpoint: &str) -> Result<String> {
    let parsed = Url::parse(endpoint).with_context(|| format!("Invalid endpoint format: {}", endpoint))?;
    match parsed.scheme() {
        "tcp" | "ssl" | "http" | "https" => {}
        other => anyhow::bail!("Unsupported endpoint scheme '{}' in {}", other, endpoint),
    }
    let host = parsed
        .host_str()
        .with_context(|| format!("Endpoint has no host: {}", endpoint))?;
    let port = parsed
        .port_or_known_default()
        .with_context(|| format!("Endpoint has no port: {}", endpoint))?;
    Ok(format!("{}:{}", host, port))
}

pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Writes key material into `dir/secret-key` and returns the file path.
pub fn write_key_file(dir: &Path, key: &str) -> Result<PathBuf> {
    create_dir(dir)?;
    let key_path = dir.join("secret-key");
    fs::write(&key_path, key.as_bytes())
        .with_context(|| format!("Failed to write key file: {}", key_path.display()))?;
    Ok(key_path)
}

/// Removes a directory tree; a missing directory counts as removed.
pub fn remove_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path).with_context(|| format!("Failed to remove directory: {}", path.display()))
}

/// Number of regular files below `dir`, zero when it does not exist.
pub fn count_files(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", dir.display()))?;
        if entry.file_type().is_file() {
            count += 1;
        }
    }
    Ok(count)
}
