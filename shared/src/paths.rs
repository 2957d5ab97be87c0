//! Shared path utilities for the daemon and its clients

use anyhow::Result;
use directories::ProjectDirs;
use std::fs;
use std::path::PathBuf;

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "grouptree", "group-tree")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    let data_dir = proj_dirs.data_dir().to_path_buf();
    fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.toml"))
}

/// Get the state directory (record store and change journal)
pub fn get_state_dir() -> Result<PathBuf> {
    let state_dir = get_data_dir()?.join("state");
    fs::create_dir_all(&state_dir)?;
    Ok(state_dir)
}

/// Get the daemon socket path
/// On Unix this is a socket file; on Windows the interprocess crate maps
/// it onto a named pipe
pub fn get_socket_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("daemon.sock"))
}
