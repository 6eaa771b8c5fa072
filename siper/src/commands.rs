//! Operator actions behind the `siper` CLI.
//!
//! Every action re-derives its state from the rule file and the pin
//! directory; nothing is carried between invocations.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use siper_common::{Ipv4LpmKey, LAYOUT_VERSION};
use tracing::{info, warn};

use crate::{
    blacklist::{Blacklist, DEFAULT_VERSION, Rule},
    cidr,
    ebpf_loader::{self, StopOutcome},
    error::{self, Error},
    maps::{self, BlockMap, PinnedBlockMap},
    metrics::{MetricsReader, MetricsSnapshot},
    pins::PinPaths,
};

#[derive(Clone, Debug)]
pub struct StartOptions {
    pub iface: String,
    pub blacklist_path: PathBuf,
    pub object_path: PathBuf,
    pub dry_run: bool,
}

#[derive(Clone, Debug)]
pub struct AddOptions {
    pub blacklist_path: PathBuf,
    pub cidr: String,
    pub source: String,
    pub comment: String,
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub enum DeleteTarget {
    Cidr(String),
    Id(String),
}

pub fn start(pins: &PinPaths, opts: &StartOptions) -> Result<()> {
    let blacklist = Blacklist::load(&opts.blacklist_path)
        .context("a valid rule file is required before touching the kernel")?;
    info!(path = %opts.blacklist_path.display(), rules = blacklist.rules.len(), "rule file read");
    let plan = maps::plan_rules(&blacklist)
        .with_context(|| format!("invalid rules in {}", opts.blacklist_path.display()))?;

    if opts.dry_run {
        let summary = maps::push_plan(&mut DryRun::default(), &plan)?;
        println!(
            "dry run: {} keys would be pushed to {}, {} disabled rules skipped",
            summary.pushed,
            opts.iface,
            summary.skipped
        );
        return Ok(());
    }

    let started = ebpf_loader::start(&opts.object_path, &opts.iface, pins)?;
    let pushed = PinnedBlockMap::open(pins).and_then(|mut map| maps::push_plan(&mut map, &plan));
    let summary = match pushed {
        Ok(summary) => summary,
        Err(err) => {
            warn!(iface = %opts.iface, "rule push failed, stopping firewall: {err}");
            if let Err(stop_err) = ebpf_loader::stop(&opts.iface, pins) {
                warn!(iface = %opts.iface, "rollback failed: {stop_err}");
            }
            return Err(err).context("failed to push rules into the kernel map");
        }
    };
    println!(
        "siper attached to {} ({} mode), {} keys pushed",
        opts.iface, started.mode, summary.pushed
    );
    Ok(())
}

pub fn stop(pins: &PinPaths, iface: &str) -> Result<()> {
    match ebpf_loader::stop(iface, pins)? {
        StopOutcome::Detached => println!("siper detached from {iface}"),
        StopOutcome::NothingAttached => warn!(iface, "nothing attached, nothing to stop"),
    }
    Ok(())
}

pub fn add(pins: &PinPaths, opts: &AddOptions) -> Result<()> {
    let path = &opts.blacklist_path;
    let mut blacklist = Blacklist::load_or_create(path, DEFAULT_VERSION)?;
    let canonical = cidr::canonicalize(&opts.cidr)?;

    if let Some(existing) = blacklist.find_by_cidr(&canonical) {
        warn!(cidr = %canonical, id = %existing.id, "rule already present, not added");
        return Ok(());
    }

    let rule = blacklist
        .add(&canonical, &opts.source, &opts.comment, opts.enabled)?
        .clone();
    blacklist.save(path)?;
    println!("added {} ({})", rule.cidr, rule.id);

    if rule.enabled {
        report_not_found(on_running_map(pins, |map| map.push(&cidr::derive_key(&rule.cidr)?)))?;
    }
    Ok(())
}

pub fn delete(pins: &PinPaths, blacklist_path: &Path, target: &DeleteTarget) -> Result<()> {
    let mut blacklist = Blacklist::load(blacklist_path)?;
    let removed = match target {
        DeleteTarget::Cidr(raw) => blacklist.delete_by_cidr(&cidr::canonicalize(raw)?),
        DeleteTarget::Id(id) => blacklist.delete_by_id(id),
    };
    let removed = match removed {
        Ok(rule) => rule,
        Err(err) if err.is_not_found() => {
            warn!("{err}");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    blacklist.save(blacklist_path)?;
    println!("deleted {} ({})", removed.cidr, removed.id);

    report_not_found(on_running_map(pins, |map| {
        withdraw(map, &blacklist, &removed).map(|_| ())
    }))
}

/// Remove a deleted rule's key unless it was disabled or another enabled rule
/// still blocks the same network. Returns whether the kernel map changed.
fn withdraw(map: &mut impl BlockMap, remaining: &Blacklist, removed: &Rule) -> error::Result<bool> {
    if !removed.enabled {
        return Ok(false);
    }
    if remaining
        .rules
        .iter()
        .any(|rule| rule.enabled && rule.cidr == removed.cidr)
    {
        info!(cidr = %removed.cidr, "another enabled rule still blocks this network");
        return Ok(false);
    }
    map.remove(&cidr::derive_key(&removed.cidr)?)?;
    info!(cidr = %removed.cidr, "key withdrawn from kernel map");
    Ok(true)
}

pub fn list(blacklist_path: &Path) -> Result<()> {
    let blacklist = Blacklist::load(blacklist_path)?;
    write_rules(&mut io::stdout().lock(), &blacklist)?;
    Ok(())
}

fn write_rules(out: &mut impl Write, blacklist: &Blacklist) -> io::Result<()> {
    writeln!(
        out,
        "version {} | {} rules | updated {}",
        blacklist.version,
        blacklist.rules.len(),
        blacklist.updated_at.to_rfc3339()
    )?;
    for rule in &blacklist.rules {
        let state = if rule.enabled { "enabled" } else { "disabled" };
        writeln!(
            out,
            "{}  {:<18}  {:<8}  source={}  comment={}",
            rule.id, rule.cidr, state, rule.source, rule.comment
        )?;
    }
    Ok(())
}

pub fn dump_keys(pins: &PinPaths) -> Result<()> {
    let map = match PinnedBlockMap::open(pins) {
        Ok(map) => map,
        Err(err) => return report_not_found(Err(err)),
    };
    let mut out = io::stdout().lock();
    for key in map.keys()? {
        writeln!(out, "{}", cidr::render_key(&key))?;
    }
    Ok(())
}

pub fn dump_metrics(pins: &PinPaths, json: bool) -> Result<()> {
    let reader = match MetricsReader::open(pins) {
        Ok(reader) => reader,
        Err(err) => return report_not_found(Err(err)),
    };
    let snapshot = reader.read_all()?;
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &snapshot).context("failed to encode metrics")?;
        writeln!(out)?;
    } else {
        write_metrics(&mut out, &snapshot)?;
    }
    Ok(())
}

fn write_metrics(out: &mut impl Write, snapshot: &MetricsSnapshot) -> io::Result<()> {
    for (title, totals) in [("DROPS", snapshot.drop), ("PASSES", snapshot.pass)] {
        writeln!(out, "{title}")?;
        writeln!(out, "Packets: {}", totals.packets)?;
        writeln!(out, "Bytes: {}", totals.bytes)?;
    }
    Ok(())
}

pub fn status(pins: &PinPaths) -> Result<()> {
    println!("{}", pins.state());
    info!(
        program = %pins.program.display(),
        lpm_map = %pins.lpm_map.display(),
        metrics_map = %pins.metrics_map.display(),
        link = %pins.link.display(),
        layout = LAYOUT_VERSION,
        "pin paths"
    );
    Ok(())
}

/// Run `f` against the pinned trie. A missing pin is reported and leaves only the file changed.
fn on_running_map(
    pins: &PinPaths,
    f: impl FnOnce(&mut PinnedBlockMap) -> error::Result<()>,
) -> error::Result<()> {
    match PinnedBlockMap::open(pins) {
        Ok(mut map) => f(&mut map),
        Err(Error::NotRunning { path }) => {
            warn!(
                pin = %path.display(),
                "kernel map not pinned, only the rule file changed; if a start is in progress, check `siper dump-keys` once it finishes"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn report_not_found(result: error::Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => {
            warn!("{err}");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Logs each key instead of writing it.
#[derive(Debug, Default)]
struct DryRun {
    keys: Vec<Ipv4LpmKey>,
}

impl BlockMap for DryRun {
    fn push(&mut self, key: &Ipv4LpmKey) -> error::Result<()> {
        info!(key = %cidr::render_key(key), "would push");
        self.keys.push(*key);
        Ok(())
    }

    fn remove(&mut self, key: &Ipv4LpmKey) -> error::Result<()> {
        let before = self.keys.len();
        self.keys.retain(|k| k != key);
        if self.keys.len() == before {
            return Err(Error::KeyNotFound(cidr::render_key(key)));
        }
        Ok(())
    }

    fn keys(&self) -> error::Result<Vec<Ipv4LpmKey>> {
        Ok(self.keys.clone())
    }
}
