pub mod blacklist;
pub mod cidr;
pub mod commands;
pub mod ebpf_loader;
pub mod error;
pub mod maps;
pub mod metrics;
pub mod netlink;
pub mod pins;
