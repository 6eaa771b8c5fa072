#![no_std]

// Map layouts shared between userspace and the XDP filter object.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

/// Bumped whenever a key or value layout below changes.
pub const LAYOUT_VERSION: u32 = 1;

pub const PROGRAM_NAME: &str = "xdp_siper_firewall";
pub const LPM_MAP_NAME: &str = "ipv4_lpm_map";
pub const METRICS_MAP_NAME: &str = "metrics_map";

pub const LPM_MAX_ENTRIES: u32 = 65535;

/// Value stored for every blocked prefix. Presence of the key is what matters.
pub const BLOCKED: u32 = 1;

pub const METRICS_PASS: u32 = 0;
pub const METRICS_DROP: u32 = 1;

/// Key of the `ipv4_lpm_map` trie. `prefix_len` must stay the first field.
///
/// `data` is the address as a host-order integer (`10.0.0.5` is `0x0A000005`),
/// matching the filter's `bpf_ntohl(iph->saddr)` lookup.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Ipv4LpmKey {
    pub prefix_len: u32,
    pub data: u32,
}

impl Ipv4LpmKey {
    pub const fn octets(&self) -> [u8; 4] {
        self.data.to_be_bytes()
    }
}

/// One per-CPU slot of `metrics_map`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct DataRec {
    pub packets: u64,
    pub bytes: u64,
}

const _: () = assert!(core::mem::size_of::<Ipv4LpmKey>() == 8);
const _: () = assert!(core::mem::size_of::<DataRec>() == 16);

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MetricSlot {
    Pass = METRICS_PASS,
    Drop = METRICS_DROP,
}

impl MetricSlot {
    pub const ALL: [MetricSlot; 2] = [MetricSlot::Pass, MetricSlot::Drop];

    pub const fn index(self) -> u32 {
        self as u32
    }
}

#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::DataRec;
    use aya::Pod;

    unsafe impl Pod for DataRec {}
}
