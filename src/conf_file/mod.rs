//! Configuration Files
//!
//! The on-disk representation of a grid: one index file listing the
//! clusters, one file per cluster, and the `config.version` sidecar
//! that makes multi-file rewrites atomic and crash-recoverable.

pub mod parser;
pub mod version_file;
pub mod writer;

pub use parser::{parse_cluster_file, parse_grid_index, ClusterListEntry};
pub use version_file::{ConfigState, VersionFile};
pub use writer::{cluster_file_name, grid_index_file_name};

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::GridConfig;
use crate::osutil;

/// A grid configuration directory with the atomic rewrite protocol.
pub struct ConfigDir {
    dir: PathBuf,
}

impl ConfigDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Current version recorded in the sidecar, 0 when none exists.
    pub fn current_version(&self) -> Result<u32> {
        Ok(version_file::read_version_file(&self.dir)?
            .map(|vf| vf.version)
            .unwrap_or(0))
    }

    /// Startup recovery.
    ///
    /// Consults the sidecar; a missing file means version 0. A `Busy`
    /// owner that is no longer alive is replaced by us. An `Update`
    /// state means a writer crashed mid-rewrite; the finishing step is
    /// to drop every config file that does not belong to the recorded
    /// version. Returns the recovered version.
    pub fn recover(&self) -> Result<u32> {
        fs::create_dir_all(&self.dir)?;
        let Some(vf) = version_file::read_version_file(&self.dir)? else {
            return Ok(0);
        };
        match vf.state {
            ConfigState::Idle => {}
            ConfigState::Busy => {
                if osutil::is_pid_alive(vf.pid)? {
                    return Err(Error::Config(format!(
                        "configuration directory owned by live process {}",
                        vf.pid
                    )));
                }
                info!(pid = vf.pid, "previous owner is dead, taking ownership");
            }
            ConfigState::UpdateClusterConfig | ConfigState::UpdateConfigs => {
                if osutil::is_pid_alive(vf.pid)? {
                    return Err(Error::Config(format!(
                        "configuration update in progress by live process {}",
                        vf.pid
                    )));
                }
                info!(
                    version = vf.version,
                    "previous writer crashed mid-update, finishing cleanup"
                );
            }
        }
        // Drop files of any version other than the authoritative one.
        self.remove_versions_except(vf.version)?;
        version_file::write_version_file(
            &self.dir,
            VersionFile {
                version: vf.version,
                state: ConfigState::Idle,
                pid: osutil::own_pid(),
            },
        )?;
        Ok(vf.version)
    }

    /// Write the full grid configuration, advancing from `old_version`
    /// to `old_version + 1`.
    ///
    /// Steps: clean up any `old_version - 1` garbage from an earlier
    /// crash, write the new files, flip the sidecar (aborting if a
    /// racing writer got there first), then delete the old files.
    pub fn write_full_config(&self, grid: &GridConfig, old_version: u32) -> Result<u32> {
        fs::create_dir_all(&self.dir)?;
        let new_version = old_version + 1;

        if old_version > 1 {
            self.remove_config_files(grid, old_version - 1)?;
        }

        let write_result = self.write_files(grid, new_version);
        let sidecar_result = write_result.and_then(|_| {
            version_file::write_version_file(
                &self.dir,
                VersionFile {
                    version: new_version,
                    state: ConfigState::Idle,
                    pid: osutil::own_pid(),
                },
            )
        });
        if let Err(e) = sidecar_result {
            // Unwind: the new files must not survive a failed flip.
            let _ = self.remove_config_files(grid, new_version);
            if old_version == 0 {
                let _ = version_file::remove_version_file(&self.dir);
            }
            return Err(e);
        }
        if old_version > 0 {
            self.remove_config_files(grid, old_version)?;
        }
        info!(version = new_version, "grid configuration written");
        Ok(new_version)
    }

    /// Load the grid configuration for the current sidecar version.
    pub fn load(&self) -> Result<(GridConfig, u32)> {
        let version = self.current_version()?;
        if version == 0 {
            return Err(Error::FileNotFound(format!(
                "no configuration present in {}",
                self.dir.display()
            )));
        }
        let index_path = self.dir.join(grid_index_file_name(version));
        let index_text = fs::read_to_string(&index_path)
            .map_err(|_| Error::FileNotFound(index_path.display().to_string()))?;
        let entries = parse_grid_index(&index_text)?;
        let mut grid = GridConfig::new();
        for entry in &entries {
            let path = self
                .dir
                .join(cluster_file_name(&entry.cluster_name, version));
            let text = fs::read_to_string(&path)
                .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
            let cluster = parse_cluster_file(
                &text,
                entry.cluster_id,
                &entry.cluster_name,
                &entry.password,
            )?;
            grid.insert(cluster)?;
        }
        debug!(version, clusters = grid.len(), "grid configuration loaded");
        Ok((grid, version))
    }

    /// First-start bootstrap: read the unversioned files a process
    /// controller installed (`config.ini` plus one `<cluster_name>.ini`
    /// per cluster) and commit them as version 1.
    pub fn bootstrap_from_installed(&self, install_dir: &Path) -> Result<u32> {
        let index_path = install_dir.join("config.ini");
        let index_text = fs::read_to_string(&index_path)
            .map_err(|_| Error::FileNotFound(index_path.display().to_string()))?;
        let entries = parse_grid_index(&index_text)?;
        let mut grid = GridConfig::new();
        for entry in &entries {
            let path = install_dir.join(format!("{}.ini", entry.cluster_name));
            let text = fs::read_to_string(&path)
                .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
            let cluster = parse_cluster_file(
                &text,
                entry.cluster_id,
                &entry.cluster_name,
                &entry.password,
            )?;
            grid.insert(cluster)?;
        }
        info!(clusters = grid.len(), "bootstrapping grid configuration");
        self.write_full_config(&grid, 0)
    }

    fn write_files(&self, grid: &GridConfig, version: u32) -> Result<()> {
        let entries: Vec<ClusterListEntry> = grid
            .iter()
            .map(|c| ClusterListEntry {
                cluster_name: c.cluster_name.clone(),
                cluster_id: c.cluster_id,
                password: c.password.clone(),
            })
            .collect();
        let index = writer::render_grid_index(&entries);
        fs::write(self.dir.join(grid_index_file_name(version)), index)?;
        for cluster in grid.iter() {
            let text = writer::render_cluster_file(cluster)?;
            fs::write(
                self.dir.join(cluster_file_name(&cluster.cluster_name, version)),
                text,
            )?;
        }
        Ok(())
    }

    fn remove_config_files(&self, grid: &GridConfig, version: u32) -> Result<()> {
        let mut names: Vec<String> = vec![grid_index_file_name(version)];
        names.extend(
            grid.iter()
                .map(|c| cluster_file_name(&c.cluster_name, version)),
        );
        for name in names {
            match fs::remove_file(self.dir.join(&name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete every versioned config file whose version differs from
    /// `keep`. Used by startup recovery, where the set of cluster names
    /// of a dead version is unknown.
    fn remove_versions_except(&self, keep: u32) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(version) = file_version(name) else { continue };
            if version != keep {
                warn!(file = name, "removing config file of stale version");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Extract the version from a `<stem>_v<N>.ini` or `config_v<N>.ini`
/// file name.
fn file_version(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".ini")?;
    let (_, v) = stem.rsplit_once("_v")?;
    v.parse().ok()
}
