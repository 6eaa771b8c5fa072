use std::{convert::TryFrom, path::Path};

use aya::maps::{Map, MapData, PerCpuArray};
use serde::Serialize;
use siper_common::{DataRec, METRICS_MAP_NAME, MetricSlot};

use crate::{
    error::{Error, Result},
    pins::PinPaths,
};

/// Pass/drop totals summed across CPUs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Totals {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub drop: Totals,
    pub pass: Totals,
}

/// Reader over the pinned per-CPU `metrics_map`.
///
/// Each CPU's record is read at a slightly different moment, so totals are
/// fine for monitoring but are not a transactional snapshot.
pub struct MetricsReader {
    array: PerCpuArray<MapData, DataRec>,
}

impl MetricsReader {
    pub fn open(pins: &PinPaths) -> Result<Self> {
        Self::open_path(&pins.metrics_map)
    }

    fn open_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotRunning {
                path: path.to_path_buf(),
            });
        }
        let map_data = MapData::from_pin(path).map_err(|source| Error::Map {
            op: "open pinned",
            source,
        })?;
        let map = Map::from_map_data(map_data).map_err(|source| Error::Layout {
            name: METRICS_MAP_NAME,
            source,
        })?;
        let array = PerCpuArray::try_from(map).map_err(|source| Error::Layout {
            name: METRICS_MAP_NAME,
            source,
        })?;
        Ok(Self { array })
    }

    pub fn read(&self, slot: MetricSlot) -> Result<Totals> {
        let per_cpu = self
            .array
            .get(&slot.index(), 0)
            .map_err(|source| Error::Map {
                op: "lookup",
                source,
            })?;
        Ok(sum_counters(per_cpu.iter()))
    }

    pub fn read_all(&self) -> Result<MetricsSnapshot> {
        Ok(MetricsSnapshot {
            drop: self.read(MetricSlot::Drop)?,
            pass: self.read(MetricSlot::Pass)?,
        })
    }
}

fn sum_counters<'a, I>(values: I) -> Totals
where
    I: IntoIterator<Item = &'a DataRec>,
{
    values.into_iter().fold(Totals::default(), |acc, rec| Totals {
        packets: acc.packets.saturating_add(rec.packets),
        bytes: acc.bytes.saturating_add(rec.bytes),
    })
}
