use std::{io, path::PathBuf};

use aya::{
    EbpfError,
    maps::MapError,
    pin::PinError,
    programs::ProgramError,
};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid cidr '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("trailing data after blacklist object in {}", path.display())]
    TrailingData { path: PathBuf },

    #[error("encode blacklist: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("blacklist is empty")]
    EmptyBlacklist,

    #[error("cidr not found in blacklist: {0}")]
    CidrNotFound(String),

    #[error("id not found in blacklist: {0}")]
    IdNotFound(String),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load eBPF object {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: EbpfError,
    },

    #[error("{kind} {name} not found in eBPF object")]
    MissingObject { kind: &'static str, name: &'static str },

    #[error("program {name}: {source}")]
    Program {
        name: &'static str,
        #[source]
        source: ProgramError,
    },

    #[error("map {name} does not match the expected layout: {source}")]
    Layout {
        name: &'static str,
        #[source]
        source: MapError,
    },

    #[error("interface {iface} not found: {source}")]
    InterfaceNotFound {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("attach on {iface} failed; native: {native}; generic fallback: {generic}")]
    Attach {
        iface: String,
        native: ProgramError,
        generic: ProgramError,
    },

    #[error("failed to pin {}: {source}", path.display())]
    Pin {
        path: PathBuf,
        #[source]
        source: PinError,
    },

    #[error("already running: {} exists (run `siper stop` first)", path.display())]
    AlreadyRunning { path: PathBuf },

    #[error("not running: {} is not pinned", path.display())]
    NotRunning { path: PathBuf },

    #[error("map {op} failed: {source}")]
    Map {
        op: &'static str,
        #[source]
        source: MapError,
    },

    #[error("{count} enabled rules exceed the trie capacity of {capacity}")]
    TooManyRules { count: usize, capacity: u32 },

    #[error("key {0} not present in map")]
    KeyNotFound(String),

    #[error("detach xdp from {iface}: {source}")]
    Detach {
        iface: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_cidr(cidr: &str, reason: impl Into<String>) -> Self {
        Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: reason.into(),
        }
    }

    /// Conditions an operator should see reported rather than fail on.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::CidrNotFound(_)
                | Error::IdNotFound(_)
                | Error::EmptyBlacklist
                | Error::KeyNotFound(_)
                | Error::NotRunning { .. }
        )
    }
}
