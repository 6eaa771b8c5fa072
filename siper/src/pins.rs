use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

pub const DEFAULT_BPFFS: &str = "/sys/fs/bpf";

const PROGRAM_PIN: &str = "siperprogram";
const LPM_MAP_PIN: &str = "siperipv4lpmmap";
const METRICS_MAP_PIN: &str = "sipermetricsmap";
const LINK_PIN: &str = "siperlink";

/// Filesystem handles through which separate invocations rediscover kernel state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PinPaths {
    pub program: PathBuf,
    pub lpm_map: PathBuf,
    pub metrics_map: PathBuf,
    pub link: PathBuf,
}

impl Default for PinPaths {
    fn default() -> Self {
        Self::in_dir(DEFAULT_BPFFS)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    Unloaded,
    Loaded,
    Attached,
    Pinned,
    /// Some pins exist and some do not, e.g. after an interrupted start.
    Stale,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Attached => "attached",
            LifecycleState::Pinned => "pinned",
            LifecycleState::Stale => "stale",
        };
        f.write_str(name)
    }
}

impl PinPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            program: dir.join(PROGRAM_PIN),
            lpm_map: dir.join(LPM_MAP_PIN),
            metrics_map: dir.join(METRICS_MAP_PIN),
            link: dir.join(LINK_PIN),
        }
    }

    /// Pins that every started firewall has. The link pin only exists with bpf_link attachment.
    pub fn required(&self) -> [&Path; 3] {
        [&self.lpm_map, &self.metrics_map, &self.program]
    }

    pub fn all(&self) -> [&Path; 4] {
        [&self.lpm_map, &self.metrics_map, &self.program, &self.link]
    }

    pub fn state(&self) -> LifecycleState {
        let present = self.required().iter().filter(|p| p.exists()).count();
        match present {
            0 if !self.link.exists() => LifecycleState::Unloaded,
            3 => LifecycleState::Pinned,
            _ => LifecycleState::Stale,
        }
    }

    /// First pin path that already exists, if any.
    pub fn first_existing(&self) -> Option<&Path> {
        self.all().into_iter().find(|p| p.exists())
    }
}

/// Remove a pin, treating an absent path as already removed.
pub fn remove_pin(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "unpinned");
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Removes every recorded pin on drop unless disarmed.
#[derive(Debug, Default)]
pub struct PinGuard {
    pinned: Vec<PathBuf>,
}

impl PinGuard {
    pub fn record(&mut self, path: &Path) {
        self.pinned.push(path.to_path_buf());
    }

    pub fn disarm(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.pinned)
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        for path in self.pinned.iter().rev() {
            if let Err(err) = remove_pin(path) {
                warn!(path = %path.display(), "failed to roll back pin: {err}");
            }
        }
    }
}
