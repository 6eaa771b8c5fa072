use std::{convert::TryFrom, fmt, io, path::Path};

use aya::{
    Ebpf, EbpfLoader,
    maps::{LpmTrie, PerCpuArray},
    programs::{
        Xdp, XdpFlags,
        links::{FdLink, PinnedLink},
        xdp::XdpLink,
    },
};
use siper_common::{DataRec, LAYOUT_VERSION, LPM_MAP_NAME, METRICS_MAP_NAME, PROGRAM_NAME};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    netlink,
    pins::{LifecycleState, PinGuard, PinPaths, remove_pin},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachMode {
    /// Driver-native XDP.
    Native,
    /// Generic (skb) XDP, available on every driver.
    Generic,
}

impl AttachMode {
    fn flags(self) -> XdpFlags {
        match self {
            AttachMode::Native => XdpFlags::DRV_MODE,
            AttachMode::Generic => XdpFlags::SKB_MODE,
        }
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachMode::Native => f.write_str("native"),
            AttachMode::Generic => f.write_str("generic"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Started {
    pub mode: AttachMode,
    /// False when the kernel lacks bpf_link XDP and the attachment is netlink-owned.
    pub link_pinned: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    Detached,
    NothingAttached,
}

enum Attachment {
    Link(FdLink),
    Netlink { ifindex: u32, mode: AttachMode },
}

impl Attachment {
    fn new(link: XdpLink, ifindex: u32, mode: AttachMode) -> Self {
        match FdLink::try_from(link) {
            Ok(fd_link) => Attachment::Link(fd_link),
            // The netlink link is dropped without detaching, so the program
            // stays attached after this process exits.
            Err(_) => Attachment::Netlink { ifindex, mode },
        }
    }
}

/// Try driver-native attach first, then generic. Returns both failures when neither works.
pub fn attach_with_fallback<T, E, F>(mut attach: F) -> std::result::Result<(T, AttachMode), (E, E)>
where
    E: fmt::Display,
    F: FnMut(XdpFlags) -> std::result::Result<T, E>,
{
    let native = match attach(AttachMode::Native.flags()) {
        Ok(id) => return Ok((id, AttachMode::Native)),
        Err(err) => err,
    };
    warn!("native XDP attach failed, falling back to generic mode: {native}");
    match attach(AttachMode::Generic.flags()) {
        Ok(id) => Ok((id, AttachMode::Generic)),
        Err(generic) => Err((native, generic)),
    }
}

/// Load `object_path`, attach its XDP program to `iface` and pin the maps,
/// the program and (when available) the link under `pins`.
///
/// Nothing stays pinned or attached if any step fails.
pub fn start(object_path: &Path, iface: &str, pins: &PinPaths) -> Result<Started> {
    if let Some(path) = pins.first_existing() {
        return Err(Error::AlreadyRunning {
            path: path.to_path_buf(),
        });
    }

    bump_memlock_rlimit();

    let mut bpf = EbpfLoader::new()
        .load_file(object_path)
        .map_err(|source| Error::Load {
            path: object_path.to_path_buf(),
            source,
        })?;
    check_layout(&bpf)?;
    info!(
        object = %object_path.display(),
        layout = LAYOUT_VERSION,
        state = %LifecycleState::Loaded,
        "eBPF object loaded"
    );

    let ifindex = netlink::ifindex(iface).map_err(|source| Error::InterfaceNotFound {
        iface: iface.to_string(),
        source,
    })?;

    let program = xdp_program(&mut bpf)?;
    program.load().map_err(|source| Error::Program {
        name: PROGRAM_NAME,
        source,
    })?;
    let (link_id, mode) = attach_with_fallback(|flags| program.attach(iface, flags)).map_err(
        |(native, generic)| Error::Attach {
            iface: iface.to_string(),
            native,
            generic,
        },
    )?;
    let link = program.take_link(link_id).map_err(|source| Error::Program {
        name: PROGRAM_NAME,
        source,
    })?;
    let attachment = Attachment::new(link, ifindex, mode);
    info!(iface, %mode, state = %LifecycleState::Attached, "XDP program attached");

    let netlink_owned = match &attachment {
        Attachment::Link(_) => None,
        Attachment::Netlink { ifindex, mode } => Some((*ifindex, *mode)),
    };
    match pin_all(&mut bpf, attachment, pins) {
        Ok(link_pinned) => {
            info!(iface, %mode, state = %LifecycleState::Pinned, "firewall started");
            Ok(Started { mode, link_pinned })
        }
        Err(err) => {
            if let Some((ifindex, mode)) = netlink_owned {
                if let Err(clear_err) = netlink::clear_xdp(ifindex, mode.flags().bits()) {
                    warn!(iface, "failed to release XDP attachment after pin failure: {clear_err}");
                }
            }
            Err(err)
        }
    }
}

fn xdp_program(bpf: &mut Ebpf) -> Result<&mut Xdp> {
    bpf.program_mut(PROGRAM_NAME)
        .ok_or(Error::MissingObject {
            kind: "program",
            name: PROGRAM_NAME,
        })?
        .try_into()
        .map_err(|source| Error::Program {
            name: PROGRAM_NAME,
            source,
        })
}

fn check_layout(bpf: &Ebpf) -> Result<()> {
    let lpm = bpf.map(LPM_MAP_NAME).ok_or(Error::MissingObject {
        kind: "map",
        name: LPM_MAP_NAME,
    })?;
    LpmTrie::<_, u32, u32>::try_from(lpm).map_err(|source| Error::Layout {
        name: LPM_MAP_NAME,
        source,
    })?;

    let metrics = bpf.map(METRICS_MAP_NAME).ok_or(Error::MissingObject {
        kind: "map",
        name: METRICS_MAP_NAME,
    })?;
    PerCpuArray::<_, DataRec>::try_from(metrics).map_err(|source| Error::Layout {
        name: METRICS_MAP_NAME,
        source,
    })?;
    Ok(())
}

fn pin_all(bpf: &mut Ebpf, attachment: Attachment, pins: &PinPaths) -> Result<bool> {
    let mut guard = PinGuard::default();
    pin_map(bpf, LPM_MAP_NAME, &pins.lpm_map, &mut guard)?;
    pin_map(bpf, METRICS_MAP_NAME, &pins.metrics_map, &mut guard)?;

    xdp_program(bpf)?
        .pin(&pins.program)
        .map_err(|source| Error::Pin {
            path: pins.program.clone(),
            source,
        })?;
    guard.record(&pins.program);

    let link_pinned = match attachment {
        Attachment::Link(fd_link) => {
            fd_link.pin(&pins.link).map_err(|source| Error::Pin {
                path: pins.link.clone(),
                source,
            })?;
            guard.record(&pins.link);
            true
        }
        Attachment::Netlink { .. } => {
            debug!("bpf_link XDP unsupported, attachment is netlink-owned");
            false
        }
    };

    for path in guard.disarm() {
        debug!(path = %path.display(), "pinned");
    }
    Ok(link_pinned)
}

fn pin_map(bpf: &mut Ebpf, map_name: &'static str, path: &Path, guard: &mut PinGuard) -> Result<()> {
    let map = bpf.map_mut(map_name).ok_or(Error::MissingObject {
        kind: "map",
        name: map_name,
    })?;
    map.pin(path).map_err(|source| Error::Pin {
        path: path.to_path_buf(),
        source,
    })?;
    guard.record(path);
    Ok(())
}

/// Detach the firewall from `iface` and remove every pin.
///
/// Pins are removed even when detaching fails; that failure is returned afterwards.
pub fn stop(iface: &str, pins: &PinPaths) -> Result<StopOutcome> {
    let had_pins = pins.first_existing().is_some();
    let detached = detach(iface, pins);

    for path in pins.all() {
        if let Err(err) = remove_pin(path) {
            warn!(path = %path.display(), "failed to remove pin: {err}");
        }
    }

    detached?;
    if had_pins {
        info!(iface, state = %LifecycleState::Unloaded, "firewall stopped");
        Ok(StopOutcome::Detached)
    } else {
        Ok(StopOutcome::NothingAttached)
    }
}

fn detach(iface: &str, pins: &PinPaths) -> Result<()> {
    let ifindex = netlink::ifindex(iface).map_err(|source| Error::Detach {
        iface: iface.to_string(),
        source,
    })?;

    if pins.link.exists() {
        match PinnedLink::from_pin(&pins.link) {
            Ok(pinned) => {
                let link = pinned
                    .unpin()
                    .map_err(|source| Error::io("unpin link", &pins.link, source))?;
                // Last reference to the bpf_link: dropping it detaches the program.
                drop(link);
                debug!(iface, "bpf_link released");
            }
            Err(err) => warn!(path = %pins.link.display(), "cannot open pinned link: {err}"),
        }
    }

    // Covers netlink-owned attachments. Clearing an empty slot succeeds.
    let mut cleared = false;
    let mut last_err = None;
    for mode in [AttachMode::Generic, AttachMode::Native] {
        match netlink::clear_xdp(ifindex, mode.flags().bits()) {
            Ok(()) => {
                debug!(iface, %mode, "XDP attachment cleared");
                cleared = true;
            }
            Err(err) if err.raw_os_error() == Some(libc::EOPNOTSUPP) => {
                debug!(iface, %mode, "mode not supported by driver");
            }
            Err(err) => last_err = Some(err),
        }
    }
    if cleared {
        return Ok(());
    }
    Err(Error::Detach {
        iface: iface.to_string(),
        source: last_err.unwrap_or_else(|| io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
    })
}

fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, fs};

    use super::*;

    #[test]
    fn native_attach_wins_when_supported() {
        let calls = RefCell::new(Vec::new());
        let out = attach_with_fallback(|flags: XdpFlags| {
            calls.borrow_mut().push(flags.bits());
            Ok::<_, String>(7)
        });
        assert_eq!(out, Ok((7, AttachMode::Native)));
        assert_eq!(*calls.borrow(), vec![XdpFlags::DRV_MODE.bits()]);
    }

    #[test]
    fn falls_back_to_generic_once() {
        let calls = RefCell::new(Vec::new());
        let out = attach_with_fallback(|flags: XdpFlags| {
            calls.borrow_mut().push(flags.bits());
            if flags.bits() == XdpFlags::DRV_MODE.bits() {
                Err("driver lacks XDP".to_string())
            } else {
                Ok(3)
            }
        });
        assert_eq!(out, Ok((3, AttachMode::Generic)));
        assert_eq!(
            *calls.borrow(),
            vec![XdpFlags::DRV_MODE.bits(), XdpFlags::SKB_MODE.bits()]
        );
    }

    #[test]
    fn both_failures_are_reported() {
        let mut attempts = 0;
        let out: std::result::Result<(u32, AttachMode), _> = attach_with_fallback(|_| {
            attempts += 1;
            Err(format!("attempt {attempts}"))
        });
        assert_eq!(out, Err(("attempt 1".to_string(), "attempt 2".to_string())));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn start_refuses_when_pins_exist() {
        let dir = tempfile::tempdir().unwrap();
        let pins = PinPaths::in_dir(dir.path());
        fs::write(&pins.metrics_map, b"").unwrap();
        let err = start(Path::new("missing.o"), "lo", &pins).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { ref path } if path == &pins.metrics_map));
    }

    #[test]
    fn start_with_missing_object_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let pins = PinPaths::in_dir(dir.path());
        let err = start(&dir.path().join("absent.o"), "lo", &pins).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(pins.first_existing().is_none());
    }

    #[test]
    fn stop_on_unknown_interface_still_removes_pins() {
        let dir = tempfile::tempdir().unwrap();
        let pins = PinPaths::in_dir(dir.path());
        for path in pins.required() {
            fs::write(path, b"").unwrap();
        }
        let err = stop("siper-no-such-if0", &pins).unwrap_err();
        assert!(matches!(err, Error::Detach { .. }));
        assert!(pins.first_existing().is_none());
    }
}
