use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::{Builder, TempPath};
use tracing::debug;
use uuid::Uuid;

use crate::{
    cidr,
    error::{Error, Result},
};

pub const DEFAULT_VERSION: &str = "1";

/// Address family tag of a rule. Only IPv4 is accepted.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Ipv4,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub id: String,
    pub cidr: String,
    pub family: Family,
    pub enabled: bool,
    pub source: String,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Blacklist {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rules: Vec<Rule>,
}

/// Time-ordered identifier; lexical order follows creation order within a process.
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

impl Blacklist {
    pub fn create(version: &str) -> Self {
        let now = Utc::now();
        Self {
            version: version.to_string(),
            created_at: now,
            updated_at: now,
            rules: Vec::new(),
        }
    }

    pub fn add(&mut self, cidr: &str, source: &str, comment: &str, enabled: bool) -> Result<&Rule> {
        let canon = cidr::canonicalize(cidr)?;
        let now = Utc::now();
        self.rules.push(Rule {
            id: generate_id(),
            cidr: canon,
            family: Family::Ipv4,
            enabled,
            source: source.to_string(),
            comment: comment.to_string(),
            created_at: now,
        });
        self.updated_at = now;
        Ok(&self.rules[self.rules.len() - 1])
    }

    /// Remove the first rule whose stored CIDR equals `cidr` verbatim.
    pub fn delete_by_cidr(&mut self, cidr: &str) -> Result<Rule> {
        self.delete_first(|rule| rule.cidr == cidr)
            .ok_or_else(|| Error::CidrNotFound(cidr.to_string()))?
    }

    pub fn delete_by_id(&mut self, id: &str) -> Result<Rule> {
        self.delete_first(|rule| rule.id == id)
            .ok_or_else(|| Error::IdNotFound(id.to_string()))?
    }

    fn delete_first(&mut self, pred: impl Fn(&Rule) -> bool) -> Option<Result<Rule>> {
        if self.rules.is_empty() {
            return Some(Err(Error::EmptyBlacklist));
        }
        let idx = self.rules.iter().position(pred)?;
        self.updated_at = Utc::now();
        Some(Ok(self.rules.remove(idx)))
    }

    pub fn find_by_cidr(&self, cidr: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.cidr == cidr)
    }

    /// Strict decode: unknown fields and trailing content are errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::io("read", path, e))?;

        let mut de = serde_json::Deserializer::from_slice(&bytes);
        let blacklist = Blacklist::deserialize(&mut de).map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        de.end().map_err(|_| Error::TrailingData {
            path: path.to_path_buf(),
        })?;

        debug!(path = %path.display(), rules = blacklist.rules.len(), "blacklist loaded");
        Ok(blacklist)
    }

    /// Load `path`, or start a fresh blacklist when the file does not exist yet.
    pub fn load_or_create(path: impl AsRef<Path>, version: &str) -> Result<Self> {
        match Self::load(path) {
            Err(Error::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(Self::create(version))
            }
            other => other,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.stage(path)?.commit(path)
    }

    /// Write the encoded blacklist to a synced, closed temp file next to `path`.
    pub fn stage(&self, path: &Path) -> Result<StagedWrite> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let encoded = serde_json::to_vec_pretty(self)?;

        let mut tmp = Builder::new()
            .prefix(".blacklist-")
            .suffix(".json")
            .tempfile_in(dir)
            .map_err(|e| Error::io("create temp file in", dir, e))?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(&encoded)
            .map_err(|e| Error::io("write", &tmp_path, e))?;
        tmp.flush().map_err(|e| Error::io("flush", &tmp_path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io("fsync", &tmp_path, e))?;

        Ok(StagedWrite {
            temp: tmp.into_temp_path(),
        })
    }
}

/// A fully written temp file awaiting its rename. Dropping it removes the file.
pub struct StagedWrite {
    temp: TempPath,
}

impl StagedWrite {
    pub fn path(&self) -> &Path {
        &self.temp
    }

    pub fn commit(self, dest: &Path) -> Result<()> {
        let src: PathBuf = self.temp.to_path_buf();
        self.temp
            .persist(dest)
            .map_err(|e| Error::io("rename temp file onto", dest, e.error))?;
        debug!(from = %src.display(), to = %dest.display(), "blacklist committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Blacklist {
        let mut b = Blacklist::create(DEFAULT_VERSION);
        b.add("10.0.0.0/8", "feed", "rfc1918", true).unwrap();
        b.add("192.168.1.77/24", "manual", "", false).unwrap();
        b
    }

    #[test]
    fn create_stamps_both_timestamps() {
        let b = Blacklist::create("2");
        assert_eq!(b.version, "2");
        assert_eq!(b.created_at, b.updated_at);
        assert!(b.rules.is_empty());
    }

    #[test]
    fn add_canonicalizes_and_refreshes_updated_at() {
        let mut b = Blacklist::create(DEFAULT_VERSION);
        let before = b.updated_at;
        let rule = b.add("192.168.1.200/24", "src", "note", true).unwrap().clone();
        assert_eq!(rule.cidr, "192.168.1.0/24");
        assert_eq!(rule.family, Family::Ipv4);
        assert!(rule.enabled);
        assert_eq!(rule.source, "src");
        assert_eq!(rule.comment, "note");
        assert!(b.updated_at >= before);
        assert_eq!(b.rules.len(), 1);
    }

    #[test]
    fn add_propagates_codec_errors() {
        let mut b = Blacklist::create(DEFAULT_VERSION);
        assert!(matches!(
            b.add("10.0.0.300/8", "", "", true),
            Err(Error::InvalidCidr { .. })
        ));
        assert!(b.rules.is_empty());
    }

    #[test]
    fn ids_are_unique_and_sorted_by_creation() {
        let ids: Vec<String> = (0..500).map(|_| generate_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, ids);
    }

    #[test]
    fn add_then_delete_by_id_restores_count() {
        let mut b = sample();
        let count = b.rules.len();
        let id = b.add("8.8.8.8/32", "", "", true).unwrap().id.clone();
        let removed = b.delete_by_id(&id).unwrap();
        assert_eq!(removed.cidr, "8.8.8.8/32");
        assert_eq!(b.rules.len(), count);
    }

    #[test]
    fn delete_by_cidr_matches_verbatim() {
        let mut b = sample();
        assert!(matches!(
            b.delete_by_cidr("192.168.1.77/24"),
            Err(Error::CidrNotFound(_))
        ));
        let removed = b.delete_by_cidr("192.168.1.0/24").unwrap();
        assert!(!removed.enabled);
        assert_eq!(b.rules.len(), 1);
    }

    #[test]
    fn delete_removes_only_the_first_duplicate() {
        let mut b = Blacklist::create(DEFAULT_VERSION);
        let first = b.add("1.1.1.1/32", "a", "", true).unwrap().id.clone();
        let second = b.add("1.1.1.1/32", "b", "", true).unwrap().id.clone();
        assert_eq!(b.delete_by_cidr("1.1.1.1/32").unwrap().id, first);
        assert_eq!(b.rules[0].id, second);
    }

    #[test]
    fn delete_on_empty_store_reports_empty() {
        let mut b = Blacklist::create(DEFAULT_VERSION);
        assert!(matches!(
            b.delete_by_cidr("10.0.0.0/8"),
            Err(Error::EmptyBlacklist)
        ));
        assert!(matches!(b.delete_by_id("nope"), Err(Error::EmptyBlacklist)));
    }

    #[test]
    fn delete_by_missing_id_reports_not_found() {
        let mut b = sample();
        assert!(matches!(b.delete_by_id("nope"), Err(Error::IdNotFound(_))));
    }

    #[test]
    fn save_load_round_trip_preserves_everything_but_updated_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        let b = sample();

        b.save(&path).unwrap();
        let loaded = Blacklist::load(&path).unwrap();
        loaded.save(&path).unwrap();
        let reloaded = Blacklist::load(&path).unwrap();

        assert_eq!(reloaded.version, b.version);
        assert_eq!(reloaded.created_at, b.created_at);
        assert_eq!(reloaded.rules, b.rules);
    }

    #[test]
    fn save_replaces_existing_file_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        Blacklist::create(DEFAULT_VERSION).save(&path).unwrap();
        sample().save(&path).unwrap();

        assert_eq!(Blacklist::load(&path).unwrap().rules.len(), 2);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        sample().save(&path).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        value["rules"][0]["colour"] = serde_json::Value::from("red");
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(matches!(Blacklist::load(&path), Err(Error::Decode { .. })));

        value["rules"][0].as_object_mut().unwrap().remove("colour");
        value["extra"] = serde_json::Value::from(1);
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(matches!(Blacklist::load(&path), Err(Error::Decode { .. })));
    }

    #[test]
    fn load_rejects_trailing_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        sample().save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(b"\n{}");
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Blacklist::load(&path),
            Err(Error::TrailingData { .. })
        ));
    }

    #[test]
    fn load_accepts_trailing_whitespace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        sample().save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(b"\n\n  ");
        fs::write(&path, &bytes).unwrap();
        assert!(Blacklist::load(&path).is_ok());
    }

    #[test]
    fn load_rejects_foreign_family() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        sample().save(&path).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        value["rules"][0]["family"] = serde_json::Value::from("ipv6");
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(matches!(Blacklist::load(&path), Err(Error::Decode { .. })));
    }

    #[test]
    fn load_missing_file_is_io_error_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        match Blacklist::load(&path) {
            Err(Error::Io { path: p, source, .. }) => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(Blacklist::load_or_create(&path, "7").unwrap().rules.is_empty());
    }

    #[test]
    fn load_or_create_does_not_mask_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        fs::write(&path, b"{\"version\": ").unwrap();
        assert!(matches!(
            Blacklist::load_or_create(&path, DEFAULT_VERSION),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn crash_before_rename_leaves_original_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        let original = sample();
        original.save(&path).unwrap();
        let before = fs::read(&path).unwrap();

        let mut changed = original.clone();
        changed.add("9.9.9.9/32", "", "", true).unwrap();
        let staged = changed.stage(&path).unwrap();
        let temp = staged.path().to_path_buf();
        assert!(temp.exists());
        assert_ne!(temp, path);
        // Simulate the process dying: no rename and no destructor.
        std::mem::forget(staged);

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(Blacklist::load(&path).unwrap(), original);
    }

    #[test]
    fn dropped_stage_cleans_up_its_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        let staged = sample().stage(&path).unwrap();
        let temp = staged.path().to_path_buf();
        drop(staged);
        assert!(!temp.exists());
        assert!(!path.exists());
    }
}
