//! Minimal rtnetlink client for clearing an interface's XDP attachment.
//!
//! Only the one request `stop` needs is implemented: `RTM_SETLINK` carrying a
//! nested `IFLA_XDP` with `IFLA_XDP_FD = -1`.

use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

const NLMSG_HDR_LEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const NLA_HDR_LEN: usize = 4;

const RTM_SETLINK: u16 = 19;
const NLMSG_ERROR: u16 = 2;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLA_F_NESTED: u16 = 1 << 15;
const IFLA_XDP: u16 = 43;
const IFLA_XDP_FD: u16 = 1;
const IFLA_XDP_FLAGS: u16 = 3;

/// Resolve an interface name to its kernel index.
pub fn ifindex(iface: &str) -> io::Result<u32> {
    let name = CString::new(iface).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

/// Detach whatever XDP program is attached to `ifindex` in the mode selected by `flags`.
///
/// Succeeds when nothing was attached.
pub fn clear_xdp(ifindex: u32, flags: u32) -> io::Result<()> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let request = clear_xdp_request(ifindex, flags, 1);
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    let sent = unsafe {
        libc::sendto(
            sock.as_raw_fd(),
            request.as_ptr() as *const libc::c_void,
            request.len(),
            0,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buf = [0u8; 4096];
    let received = unsafe {
        libc::recv(
            sock.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    parse_ack(&buf[..received as usize])
}

fn clear_xdp_request(ifindex: u32, flags: u32, seq: u32) -> Vec<u8> {
    let mut xdp = Vec::with_capacity(2 * (NLA_HDR_LEN + 4));
    push_attr(&mut xdp, IFLA_XDP_FD, &(-1i32).to_ne_bytes());
    if flags != 0 {
        push_attr(&mut xdp, IFLA_XDP_FLAGS, &flags.to_ne_bytes());
    }

    let total = NLMSG_HDR_LEN + IFINFOMSG_LEN + NLA_HDR_LEN + xdp.len();
    let mut msg = Vec::with_capacity(total);

    // nlmsghdr
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&RTM_SETLINK.to_ne_bytes());
    msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());

    // ifinfomsg
    msg.push(libc::AF_UNSPEC as u8);
    msg.push(0);
    msg.extend_from_slice(&0u16.to_ne_bytes());
    msg.extend_from_slice(&(ifindex as i32).to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());

    push_attr(&mut msg, IFLA_XDP | NLA_F_NESTED, &xdp);
    msg
}

// Payloads here are always 4-byte multiples, so no alignment padding is needed.
fn push_attr(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = (NLA_HDR_LEN + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
}

fn parse_ack(reply: &[u8]) -> io::Result<()> {
    if reply.len() < NLMSG_HDR_LEN + 4 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short netlink reply",
        ));
    }
    let msg_type = u16::from_ne_bytes([reply[4], reply[5]]);
    if msg_type != NLMSG_ERROR {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected netlink message type {msg_type}"),
        ));
    }
    let errno = i32::from_ne_bytes([
        reply[NLMSG_HDR_LEN],
        reply[NLMSG_HDR_LEN + 1],
        reply[NLMSG_HDR_LEN + 2],
        reply[NLMSG_HDR_LEN + 3],
    ]);
    match errno {
        0 => Ok(()),
        e => Err(io::Error::from_raw_os_error(-e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XDP_FLAGS_SKB_MODE: u32 = 1 << 1;

    fn u16_at(buf: &[u8], at: usize) -> u16 {
        u16::from_ne_bytes([buf[at], buf[at + 1]])
    }

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_ne_bytes(buf[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn request_layout_without_flags() {
        let msg = clear_xdp_request(7, 0, 42);
        assert_eq!(msg.len(), 16 + 16 + 4 + 8);
        assert_eq!(u32_at(&msg, 0) as usize, msg.len());
        assert_eq!(u16_at(&msg, 4), RTM_SETLINK);
        assert_eq!(u16_at(&msg, 6), NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(u32_at(&msg, 8), 42);
        assert_eq!(u32_at(&msg, 20), 7);

        assert_eq!(u16_at(&msg, 32), 12);
        assert_eq!(u16_at(&msg, 34), IFLA_XDP | NLA_F_NESTED);
        assert_eq!(u16_at(&msg, 36), 8);
        assert_eq!(u16_at(&msg, 38), IFLA_XDP_FD);
        assert_eq!(u32_at(&msg, 40) as i32, -1);
    }

    #[test]
    fn request_layout_with_flags() {
        let msg = clear_xdp_request(3, XDP_FLAGS_SKB_MODE, 1);
        assert_eq!(msg.len(), 16 + 16 + 4 + 8 + 8);
        assert_eq!(u16_at(&msg, 32), 20);
        assert_eq!(u16_at(&msg, 44), 8);
        assert_eq!(u16_at(&msg, 46), IFLA_XDP_FLAGS);
        assert_eq!(u32_at(&msg, 48), XDP_FLAGS_SKB_MODE);
    }

    fn ack(errno: i32) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend_from_slice(&36u32.to_ne_bytes());
        reply.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
        reply.extend_from_slice(&0u16.to_ne_bytes());
        reply.extend_from_slice(&1u32.to_ne_bytes());
        reply.extend_from_slice(&0u32.to_ne_bytes());
        reply.extend_from_slice(&errno.to_ne_bytes());
        reply.extend_from_slice(&[0u8; 16]);
        reply
    }

    #[test]
    fn parse_ack_accepts_zero_errno() {
        assert!(parse_ack(&ack(0)).is_ok());
    }

    #[test]
    fn parse_ack_surfaces_kernel_errno() {
        let err = parse_ack(&ack(-libc::ENODEV)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }

    #[test]
    fn parse_ack_rejects_garbage() {
        assert!(parse_ack(&[0u8; 4]).is_err());
        let mut reply = ack(0);
        reply[4] = 16;
        assert!(parse_ack(&reply).is_err());
    }

    #[test]
    fn ifindex_of_missing_interface_fails() {
        assert!(ifindex("siper-no-such-if0").is_err());
        assert!(ifindex("bad\0name").is_err());
    }
}
