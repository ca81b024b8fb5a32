//! The `config.version` sidecar.
//!
//! Three CR-terminated ASCII lines recording the current configuration
//! version, the owner state and the owner pid. The file governs the
//! atomic multi-file rewrite protocol and crash recovery.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const VERSION_FILE_NAME: &str = "config.version";

/// Owner state recorded in the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConfigState {
    Idle = 0,
    Busy = 1,
    UpdateClusterConfig = 2,
    UpdateConfigs = 3,
}

impl ConfigState {
    pub fn from_num(v: u32) -> Result<ConfigState> {
        Ok(match v {
            0 => ConfigState::Idle,
            1 => ConfigState::Busy,
            2 => ConfigState::UpdateClusterConfig,
            3 => ConfigState::UpdateConfigs,
            other => {
                return Err(Error::Config(format!(
                    "unknown state {} in {}",
                    other, VERSION_FILE_NAME
                )))
            }
        })
    }
}

/// Contents of the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionFile {
    pub version: u32,
    pub state: ConfigState,
    pub pid: u32,
}

pub fn version_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(VERSION_FILE_NAME)
}

fn parse_line(line: Option<&str>, prefix: &str) -> Result<u32> {
    let line = line.ok_or_else(|| {
        Error::Config(format!("{} truncated", VERSION_FILE_NAME))
    })?;
    line.strip_prefix(prefix)
        .and_then(|v| v.trim_end().parse::<u32>().ok())
        .ok_or_else(|| {
            Error::Config(format!(
                "malformed line '{}' in {}",
                line, VERSION_FILE_NAME
            ))
        })
}

/// Read the sidecar; `None` when it does not exist yet (version 0).
pub fn read_version_file(config_dir: &Path) -> Result<Option<VersionFile>> {
    let path = version_file_path(config_dir);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut lines = content.lines();
    let version = parse_line(lines.next(), "version: ")?;
    let state = ConfigState::from_num(parse_line(lines.next(), "state: ")?)?;
    let pid = parse_line(lines.next(), "pid: ")?;
    Ok(Some(VersionFile { version, state, pid }))
}

/// Write the sidecar, then read it back and require equality. Reading
/// back something else means a racing writer won and the caller must
/// abort its upgrade.
pub fn write_version_file(config_dir: &Path, vf: VersionFile) -> Result<()> {
    let path = version_file_path(config_dir);
    let content = format!(
        "version: {}\nstate: {}\npid: {}\n",
        vf.version, vf.state as u32, vf.pid
    );
    fs::write(&path, content)?;
    let file = fs::File::open(&path)?;
    file.sync_all()?;
    match read_version_file(config_dir)? {
        Some(read_back) if read_back == vf => Ok(()),
        _ => Err(Error::Config(
            "another process updated the configuration version".into(),
        )),
    }
}

pub fn remove_version_file(config_dir: &Path) -> Result<()> {
    match fs::remove_file(version_file_path(config_dir)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_absent_file_reads_none() {
        let dir = tempdir().unwrap();
        assert!(read_version_file(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let vf = VersionFile {
            version: 4,
            state: ConfigState::Idle,
            pid: 1234,
        };
        write_version_file(dir.path(), vf).unwrap();
        assert_eq!(read_version_file(dir.path()).unwrap(), Some(vf));
    }

    #[test]
    fn test_exact_line_format() {
        let dir = tempdir().unwrap();
        let vf = VersionFile {
            version: 7,
            state: ConfigState::Busy,
            pid: 99,
        };
        write_version_file(dir.path(), vf).unwrap();
        let text = std::fs::read_to_string(version_file_path(dir.path())).unwrap();
        assert_eq!(text, "version: 7\nstate: 1\npid: 99\n");
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(version_file_path(dir.path()), "garbage\n").unwrap();
        assert!(read_version_file(dir.path()).is_err());
    }
}
