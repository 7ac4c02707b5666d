use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use weft_config::{Family, NetworkConfig, NetworkConfigs};

use crate::{Allocator, IpamError, StorageError};

pub const DEFAULT_DATA_DIR: &str = "/run/weft";

const STATE_FILE: &str = "store.json";
const LOCK_FILE: &str = "store.lock";
const NETWORK_FILE: &str = "network.json";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoragePaths {
    pub state: PathBuf,
    pub lock: PathBuf,
    pub network: PathBuf,
}

impl StoragePaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            state: dir.join(STATE_FILE),
            lock: dir.join(LOCK_FILE),
            network: dir.join(NETWORK_FILE),
        }
    }
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::in_dir(DEFAULT_DATA_DIR)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyState {
    pub config: NetworkConfig,
    pub record: Allocator,
}

/// Everything the CNI invocations of one node share.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<FamilyState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<FamilyState>,
}

impl PlugState {
    pub fn from_network(configs: &NetworkConfigs) -> Result<Self, IpamError> {
        let mut state = Self::default();
        for (family, config) in configs.iter() {
            *state.slot(family) = Some(FamilyState {
                config: *config,
                record: Allocator::new(config.pod_cidr)?,
            });
        }
        Ok(state)
    }

    pub fn family(&self, family: Family) -> Option<&FamilyState> {
        match family {
            Family::V4 => self.ipv4.as_ref(),
            Family::V6 => self.ipv6.as_ref(),
        }
    }

    pub fn family_mut(&mut self, family: Family) -> Option<&mut FamilyState> {
        self.slot(family).as_mut()
    }

    /// Families with a pod CIDR on this node, IPv4 first.
    pub fn enabled(&self) -> impl Iterator<Item = Family> + '_ {
        Family::ALL
            .into_iter()
            .filter(|family| self.family(*family).is_some())
    }

    fn slot(&mut self, family: Family) -> &mut Option<FamilyState> {
        match family {
            Family::V4 => &mut self.ipv4,
            Family::V6 => &mut self.ipv6,
        }
    }
}

/// File backed [`PlugState`] guarded by an advisory lock.
///
/// The lock is an `flock` on a companion file, so it only excludes other
/// open file descriptions: every process (or test thread standing in for
/// one) must hold its own `Storage`.
#[derive(Debug)]
pub struct Storage {
    paths: StoragePaths,
    lock: File,
}

impl Storage {
    /// Prepares the store of this node. Safe to call on every daemon start.
    pub fn bootstrap(paths: StoragePaths, configs: &NetworkConfigs) -> Result<Self, StorageError> {
        for path in [&paths.state, &paths.lock, &paths.network] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(StorageError::io(parent))?;
            }
        }

        if paths.network.exists() {
            let existing = NetworkConfigs::load(&paths.network)?;
            if existing != *configs {
                return Err(StorageError::NetworkChanged(paths.network));
            }
            debug!(path = %paths.network.display(), "network config unchanged");
        } else {
            configs.write(&paths.network)?;
            info!(path = %paths.network.display(), "wrote network config");
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&paths.state)
            .map_err(StorageError::io(&paths.state))?;

        Self::open(paths)
    }

    pub fn open(paths: StoragePaths) -> Result<Self, StorageError> {
        if !paths.state.exists() {
            return Err(StorageError::NotBootstrapped(paths.state));
        }

        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&paths.lock)
            .map_err(StorageError::io(&paths.lock))?;

        Ok(Self { paths, lock })
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Runs `f` on the freshly loaded state while holding the lock and stores
    /// the result, even when `f` fails.
    pub fn atomic_do<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut PlugState) -> Result<T, E>,
        E: From<StorageError>,
    {
        let _guard = self.lock()?;

        let mut state = self.load()?;
        let result = f(&mut state);
        self.store(&state)?;

        result
    }

    /// Like [`Storage::atomic_do`] but never writes the state back.
    pub fn read<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&PlugState) -> Result<T, E>,
        E: From<StorageError>,
    {
        let _guard = self.lock()?;

        let state = self.load()?;
        f(&state)
    }

    fn lock(&self) -> Result<LockGuard<'_>, StorageError> {
        loop {
            match flock(self.lock.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(StorageError::Lock {
                        path: self.paths.lock.clone(),
                        source,
                    })
                }
            }
        }

        Ok(LockGuard {
            file: &self.lock,
            path: &self.paths.lock,
        })
    }

    fn load(&self) -> Result<PlugState, StorageError> {
        let path = &self.paths.state;
        let data = fs::read(path).map_err(StorageError::io(path))?;

        if data.iter().all(u8::is_ascii_whitespace) {
            if !self.paths.network.exists() {
                return Err(StorageError::NotBootstrapped(self.paths.network.clone()));
            }
            let configs = NetworkConfigs::load(&self.paths.network)?;
            debug!("initializing empty store from network config");
            return Ok(PlugState::from_network(&configs)?);
        }

        serde_json::from_slice(&data).map_err(|source| StorageError::Corrupt {
            path: path.clone(),
            source,
        })
    }

    fn store(&self, state: &PlugState) -> Result<(), StorageError> {
        let data = serde_json::to_vec(state).map_err(StorageError::Encode)?;

        let path = &self.paths.state;
        let tmp = path.with_extension("json.tmp");

        let mut file = File::create(&tmp).map_err(StorageError::io(&tmp))?;
        file.write_all(&data).map_err(StorageError::io(&tmp))?;
        file.sync_all().map_err(StorageError::io(&tmp))?;
        fs::rename(&tmp, path).map_err(StorageError::io(path))?;

        Ok(())
    }
}

struct LockGuard<'a> {
    file: &'a File,
    path: &'a Path,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %self.path.display(), %err, "failed to unlock store");
        }
    }
}
