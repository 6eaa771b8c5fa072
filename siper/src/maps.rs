use std::convert::TryFrom;

use aya::maps::{
    Map, MapData, MapError,
    lpm_trie::{Key, LpmTrie},
};
use siper_common::{BLOCKED, Ipv4LpmKey, LPM_MAP_NAME, LPM_MAX_ENTRIES};
use tracing::debug;

use crate::{
    blacklist::Blacklist,
    cidr,
    error::{Error, Result},
    pins::PinPaths,
};

/// Key/value pass-through onto the kernel trie. Overlapping prefixes are left
/// for the kernel's longest-prefix match to resolve.
pub trait BlockMap {
    /// Upsert `key` with the blocked sentinel.
    fn push(&mut self, key: &Ipv4LpmKey) -> Result<()>;
    /// Delete `key`; `Error::KeyNotFound` when absent.
    fn remove(&mut self, key: &Ipv4LpmKey) -> Result<()>;
    fn keys(&self) -> Result<Vec<Ipv4LpmKey>>;
}

pub struct PinnedBlockMap {
    trie: LpmTrie<MapData, u32, u32>,
}

impl PinnedBlockMap {
    /// Open the pinned trie. Fails with `NotRunning` instead of creating a fresh map.
    pub fn open(pins: &PinPaths) -> Result<Self> {
        let path = &pins.lpm_map;
        if !path.exists() {
            return Err(Error::NotRunning { path: path.clone() });
        }
        let map_data = MapData::from_pin(path).map_err(|source| Error::Map {
            op: "open pinned",
            source,
        })?;
        let map = Map::from_map_data(map_data).map_err(|source| Error::Layout {
            name: LPM_MAP_NAME,
            source,
        })?;
        let trie = LpmTrie::try_from(map).map_err(|source| Error::Layout {
            name: LPM_MAP_NAME,
            source,
        })?;
        Ok(Self { trie })
    }
}

fn trie_key(key: &Ipv4LpmKey) -> Key<u32> {
    Key::new(key.prefix_len, key.data)
}

impl BlockMap for PinnedBlockMap {
    fn push(&mut self, key: &Ipv4LpmKey) -> Result<()> {
        self.trie
            .insert(&trie_key(key), BLOCKED, 0)
            .map_err(|source| Error::Map {
                op: "update",
                source,
            })
    }

    fn remove(&mut self, key: &Ipv4LpmKey) -> Result<()> {
        match self.trie.remove(&trie_key(key)) {
            Ok(()) => Ok(()),
            Err(MapError::KeyNotFound) => Err(Error::KeyNotFound(cidr::render_key(key))),
            Err(MapError::SyscallError(err)) if err.io_error.raw_os_error() == Some(libc::ENOENT) => {
                Err(Error::KeyNotFound(cidr::render_key(key)))
            }
            Err(source) => Err(Error::Map {
                op: "delete",
                source,
            }),
        }
    }

    fn keys(&self) -> Result<Vec<Ipv4LpmKey>> {
        self.trie
            .keys()
            .map(|item| {
                item.map(|key| Ipv4LpmKey {
                    prefix_len: key.prefix_len(),
                    data: key.data(),
                })
                .map_err(|source| Error::Map {
                    op: "iterate",
                    source,
                })
            })
            .collect()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PushSummary {
    pub pushed: usize,
    pub skipped: usize,
}

/// Keys derived from every enabled rule, ready to push.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PushPlan {
    pub keys: Vec<Ipv4LpmKey>,
    pub skipped: usize,
}

/// Derive the key of every enabled rule without touching the kernel.
///
/// Fails on the first unparsable CIDR, or when the keys cannot fit the trie.
/// Disabled rules stay in the file but never reach the kernel.
pub fn plan_rules(blacklist: &Blacklist) -> Result<PushPlan> {
    let mut plan = PushPlan::default();
    for rule in &blacklist.rules {
        if !rule.enabled {
            debug!(cidr = %rule.cidr, id = %rule.id, "skipping disabled rule");
            plan.skipped += 1;
            continue;
        }
        plan.keys.push(cidr::derive_key(&rule.cidr)?);
    }
    check_capacity(plan.keys.len())?;
    Ok(plan)
}

fn check_capacity(count: usize) -> Result<()> {
    if count > LPM_MAX_ENTRIES as usize {
        return Err(Error::TooManyRules {
            count,
            capacity: LPM_MAX_ENTRIES,
        });
    }
    Ok(())
}

pub fn push_plan(map: &mut impl BlockMap, plan: &PushPlan) -> Result<PushSummary> {
    for key in &plan.keys {
        map.push(key)?;
        debug!(key = %cidr::render_key(key), "pushed key");
    }
    Ok(PushSummary {
        pushed: plan.keys.len(),
        skipped: plan.skipped,
    })
}

pub fn push_rules(map: &mut impl BlockMap, blacklist: &Blacklist) -> Result<PushSummary> {
    push_plan(map, &plan_rules(blacklist)?)
}
