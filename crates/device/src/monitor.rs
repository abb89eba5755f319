//! Kernel uevent multicast reader (§4.2).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::time::SystemTime;

use thiserror::Error;
use tokio::io::unix::AsyncFd;

use crate::record::{Action, Devnum, PropertyMap, RecordError};
use crate::DeviceRecord;

/// `NLMSG` multicast group used by the kernel to broadcast uevents.
/// Distinct from the userspace broadcast group (2), which §8 property
/// 1 requires we always ignore.
pub const UEVENT_GROUP_KERNEL: u32 = 1;
const UEVENT_GROUP_UDEV: u32 = 2;

const NETLINK_KOBJECT_UEVENT: libc::c_int = 15;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("datagram too short")]
    TooShort,

    #[error("datagram at or above the receive buffer size")]
    TooLong,

    #[error("multicast source group is not KERNEL")]
    WrongGroup,

    #[error("sender pid is non-zero (userspace broadcast)")]
    NonKernelSender,

    #[error("no SCM_CREDENTIALS ancillary data present")]
    MissingCredentials,

    #[error("sender uid {0} is not root")]
    UntrustedSender(u32),

    #[error("header is missing the required \"@/\" substring")]
    MissingHeaderMarker,

    #[error("record error: {0}")]
    Record(#[from] RecordError),

    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    #[error("unrecognised action: {0}")]
    UnrecognisedAction(String),

    #[error("malformed key/value entry (not valid UTF-8)")]
    InvalidUtf8,
}

/// One decoded uevent, ready for redistribution to local and remote
/// observers (§2 data flow: kernel socket → monitor → sink).
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub record: DeviceRecord,
    pub action: Action,
    pub seqnum: u64,
    pub timestamp: SystemTime,
    pub old_devpath: Option<String>,
}

/// Parses one uevent payload per §4.2 steps 3–6. Does not perform the
/// socket-level checks of steps 1–2 (group/pid/credentials); those
/// require access to the datagram's ancillary data and are done by
/// [`DeviceMonitor::poll_datagram`] before this is called.
pub fn decode_payload(sys_root: &str, buf: &[u8], recv_buf_size: usize) -> Result<MonitorEvent, MonitorError> {
    if buf.len() < MIN_UEVENT_LEN {
        return Err(MonitorError::TooShort);
    }
    if buf.len() >= recv_buf_size {
        return Err(MonitorError::TooLong);
    }

    let nul = buf.iter().position(|&b| b == 0).ok_or(MonitorError::MissingHeaderMarker)?;
    let header = std::str::from_utf8(&buf[..nul]).map_err(|_| MonitorError::InvalidUtf8)?;

    if !header.contains("@/") {
        return Err(MonitorError::MissingHeaderMarker);
    }

    let mut syspath: Option<String> = None;
    let mut subsystem: Option<String> = None;
    let mut devtype: Option<String> = None;
    let mut driver: Option<String> = None;
    let mut devnode: Option<String> = None;
    let mut ifindex: Option<i32> = None;
    let mut major: Option<u32> = None;
    let mut minor: Option<u32> = None;
    let mut action: Option<Action> = None;
    let mut seqnum: Option<u64> = None;
    let mut old_devpath: Option<String> = None;
    let mut properties = PropertyMap::new();

    let mut rest = &buf[nul + 1..];
    while !rest.is_empty() {
        let entry_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let entry = std::str::from_utf8(&rest[..entry_end]).map_err(|_| MonitorError::InvalidUtf8)?;

        if !entry.is_empty() {
            let (key, value) = entry.split_once('=').unwrap_or((entry, ""));

            match key {
                "DEVPATH" => syspath = Some(format!("{sys_root}{value}")),
                "SUBSYSTEM" => subsystem = Some(value.to_string()),
                "DEVTYPE" => devtype = Some(value.to_string()),
                "DEVNAME" => devnode = Some(value.to_string()),
                "DRIVER" => driver = Some(value.to_string()),
                "IFINDEX" => ifindex = value.parse().ok(),
                "MAJOR" => major = value.parse().ok(),
                "MINOR" => minor = value.parse().ok(),
                "ACTION" => {
                    action = Some(Action::from_str(value).map_err(|_| {
                        MonitorError::UnrecognisedAction(value.to_string())
                    })?)
                }
                "SEQNUM" => seqnum = value.parse().ok(),
                "DEVPATH_OLD" => old_devpath = Some(value.to_string()),
                "DEVMODE" | "DEVUID" | "DEVGID" | "USEC_INITIALIZED" => {
                    properties.insert(key, value)
                }
                _ => properties.insert(key, value),
            }
        }

        if entry_end >= rest.len() {
            break;
        }
        rest = &rest[entry_end + 1..];
    }

    let syspath = syspath.ok_or(MonitorError::MissingKey("DEVPATH"))?;
    let subsystem = subsystem.ok_or(MonitorError::MissingKey("SUBSYSTEM"))?;
    let action = action.ok_or(MonitorError::MissingKey("ACTION"))?;
    let seqnum = seqnum.unwrap_or(0);

    let devnum = match (major, minor) {
        (Some(major), Some(minor)) => Some(Devnum { major, minor }),
        _ => None,
    };

    let record = DeviceRecord::seal(
        sys_root,
        syspath,
        Some(subsystem),
        devtype,
        driver,
        devnode,
        devnum,
        ifindex,
        properties,
        action,
        seqnum,
        old_devpath.clone(),
    )?;

    Ok(MonitorEvent {
        record,
        action,
        seqnum,
        timestamp: SystemTime::now(),
        old_devpath,
    })
}

const MIN_UEVENT_LEN: usize = 8;

/// Kernel-netlink multicast reader. Binds (lazily, on [`Self::start`])
/// to `NETLINK_KOBJECT_UEVENT` group `KERNEL`, enabling
/// `SO_PASSCRED`/`SO_TIMESTAMP` so every datagram carries the sender's
/// credentials.
pub struct DeviceMonitor {
    sys_root: String,
    recv_buf_size: usize,
    fd: Option<AsyncFd<OwnedFd>>,
}

impl DeviceMonitor {
    pub fn new(sys_root: impl Into<String>) -> Self {
        Self {
            sys_root: sys_root.into(),
            recv_buf_size: 1 << 16,
            fd: None,
        }
    }

    /// Adopt a pre-opened, already-bound socket fd instead of opening
    /// a fresh one (§6 "adoption of pre-opened sockets").
    pub fn adopt(sys_root: impl Into<String>, fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            sys_root: sys_root.into(),
            recv_buf_size: 1 << 16,
            fd: Some(AsyncFd::new(fd)?),
        })
    }

    /// Best-effort bump of the kernel receive buffer. Failure is
    /// logged and otherwise ignored (§4.2: "fall back gracefully if
    /// the process lacks the capability").
    pub fn set_recv_buffer_size(&mut self, bytes: usize) {
        self.recv_buf_size = bytes;
        if let Some(fd) = &self.fd {
            if let Err(err) = setsockopt_rcvbuf(fd.get_ref().as_raw_fd(), bytes) {
                tracing::warn!(error = %err, "failed to raise uevent socket receive buffer; continuing with the default");
            }
        }
    }

    /// Binds the socket (if not already adopted) to the kernel uevent
    /// multicast group.
    pub fn start(&mut self) -> io::Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }

        let fd = open_uevent_socket()?;
        if let Err(err) = setsockopt_rcvbuf(fd.as_raw_fd(), self.recv_buf_size) {
            tracing::warn!(error = %err, "failed to raise uevent socket receive buffer; continuing with the default");
        }
        bind_uevent_socket(fd.as_raw_fd())?;
        self.fd = Some(AsyncFd::new(fd)?);
        Ok(())
    }

    /// Wait for and decode exactly one uevent, applying the full
    /// filter chain of §4.2/§8 property 1. Returns `Ok(None)` for a
    /// datagram that was received but rejected by the filter (the
    /// caller should simply poll again); this keeps the "no callback
    /// invoked for a rejected input" contract explicit in the return
    /// type rather than silently swallowing it.
    pub async fn recv(&mut self) -> Result<Option<MonitorEvent>, MonitorError> {
        let fd = self.fd.as_mut().expect("DeviceMonitor::start must be called first");
        let mut buf = vec![0u8; self.recv_buf_size];

        loop {
            let mut guard = fd.readable_mut().await?;
            match guard.try_io(|fd| recv_uevent_datagram(fd.get_ref().as_raw_fd(), &mut buf)) {
                Ok(Ok(Some(received))) => {
                    return Ok(self
                        .validate_and_decode(&buf[..received.len], received.group, received.pid, received.uid)
                        .map(Some)
                        .unwrap_or_else(|err| {
                            tracing::debug!(error = %err, "dropping uevent datagram");
                            None
                        }));
                }
                Ok(Ok(None)) => continue,
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => continue,
            }
        }
    }

    fn validate_and_decode(
        &self,
        buf: &[u8],
        group: u32,
        pid: u32,
        uid: Option<u32>,
    ) -> Result<MonitorEvent, MonitorError> {
        if group != UEVENT_GROUP_KERNEL {
            return Err(MonitorError::WrongGroup);
        }
        if pid != 0 {
            return Err(MonitorError::NonKernelSender);
        }
        match uid {
            None => return Err(MonitorError::MissingCredentials),
            Some(0) => {}
            Some(uid) => return Err(MonitorError::UntrustedSender(uid)),
        }

        decode_payload(&self.sys_root, buf, self.recv_buf_size)
    }
}

struct ReceivedDatagram {
    len: usize,
    group: u32,
    pid: u32,
    uid: Option<u32>,
}

fn open_uevent_socket() -> io::Result<OwnedFd> {
    let raw = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, NETLINK_KOBJECT_UEVENT) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_nonblocking(fd.as_raw_fd())?;

    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMP,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    Ok(fd)
}

fn bind_uevent_socket(fd: RawFd) -> io::Result<()> {
    // The source's monitor initialisation never sets the destination
    // netlink address before binding; we set it explicitly here
    // (design notes §9 open question) so the kernel knows which
    // multicast group to deliver to this socket.
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    addr.nl_pid = 0;
    addr.nl_groups = UEVENT_GROUP_KERNEL;

    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt_rcvbuf(fd: RawFd, bytes: usize) -> io::Result<()> {
    let size = bytes as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUFFORCE,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Receives one datagram plus its `SCM_CREDENTIALS` ancillary data
/// and multicast group, per §6. Returns `Ok(None)` on `EAGAIN`.
fn recv_uevent_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<ReceivedDatagram>> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    #[repr(C)]
    struct CmsgBuf {
        _align: [libc::cmsghdr; 0],
        buf: [u8; 128],
    }
    let mut cmsg_buf = CmsgBuf { _align: [], buf: [0; 128] };

    let mut src_addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src_addr as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_nl>() as u32;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.buf.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    let mut uid = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS {
                let cred = libc::CMSG_DATA(cmsg) as *const libc::ucred;
                uid = Some((*cred).uid);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Some(ReceivedDatagram {
        len: n as usize,
        group: src_addr.nl_groups,
        pid: src_addr.nl_pid,
        uid,
    }))
}

#[allow(dead_code)]
fn udev_group_is_ignored(group: u32) -> bool {
    group == UEVENT_GROUP_UDEV
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(header: &str, kvs: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(header.as_bytes());
        buf.push(0);
        for (k, v) in kvs {
            buf.extend_from_slice(format!("{k}={v}").as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn decodes_well_formed_add_event() {
        let buf = payload(
            "add@/devices/virtual/net/eth0",
            &[
                ("ACTION", "add"),
                ("DEVPATH", "/devices/virtual/net/eth0"),
                ("SUBSYSTEM", "net"),
                ("SEQNUM", "42"),
                ("IFINDEX", "3"),
                ("CUSTOM_PROP", "hello"),
            ],
        );

        let event = decode_payload("/sys", &buf, 1 << 16).unwrap();
        assert_eq!(event.action, Action::Add);
        assert_eq!(event.seqnum, 42);
        assert_eq!(event.record.subsystem(), Some("net"));
        assert_eq!(event.record.ifindex(), Some(3));
        assert_eq!(event.record.property("CUSTOM_PROP"), Some("hello"));
        assert!(event.record.is_sealed());
    }

    #[test]
    fn rejects_missing_header_marker() {
        let buf = payload("garbage header with no marker", &[("ACTION", "add")]);
        let err = decode_payload("/sys", &buf, 1 << 16).unwrap_err();
        assert!(matches!(err, MonitorError::MissingHeaderMarker));
    }

    #[test]
    fn rejects_missing_subsystem() {
        let buf = payload(
            "add@/devices/virtual/net/eth0",
            &[("ACTION", "add"), ("DEVPATH", "/devices/virtual/net/eth0")],
        );
        let err = decode_payload("/sys", &buf, 1 << 16).unwrap_err();
        assert!(matches!(err, MonitorError::MissingKey("SUBSYSTEM")));
    }

    #[test]
    fn rejects_unrecognised_action() {
        let buf = payload(
            "teleport@/devices/virtual/net/eth0",
            &[
                ("ACTION", "teleport"),
                ("DEVPATH", "/devices/virtual/net/eth0"),
                ("SUBSYSTEM", "net"),
            ],
        );
        let err = decode_payload("/sys", &buf, 1 << 16).unwrap_err();
        assert!(matches!(err, MonitorError::UnrecognisedAction(_)));
    }

    #[test]
    fn move_action_carries_old_devpath() {
        let buf = payload(
            "move@/devices/virtual/net/eth1",
            &[
                ("ACTION", "move"),
                ("DEVPATH", "/devices/virtual/net/eth1"),
                ("DEVPATH_OLD", "/devices/virtual/net/eth0"),
                ("SUBSYSTEM", "net"),
            ],
        );
        let event = decode_payload("/sys", &buf, 1 << 16).unwrap();
        assert_eq!(event.old_devpath.as_deref(), Some("/devices/virtual/net/eth0"));
    }

    #[test]
    fn rejects_datagram_at_or_above_recv_buffer_size() {
        let buf = payload(
            "add@/devices/virtual/net/eth0",
            &[("ACTION", "add"), ("DEVPATH", "/devices/virtual/net/eth0"), ("SUBSYSTEM", "net")],
        );
        let err = decode_payload("/sys", &buf, buf.len()).unwrap_err();
        assert!(matches!(err, MonitorError::TooLong));
    }

    #[test]
    fn major_minor_combine_into_devnum() {
        let buf = payload(
            "add@/devices/virtual/block/sda",
            &[
                ("ACTION", "add"),
                ("DEVPATH", "/devices/virtual/block/sda"),
                ("SUBSYSTEM", "block"),
                ("MAJOR", "8"),
                ("MINOR", "0"),
            ],
        );
        let event = decode_payload("/sys", &buf, 1 << 16).unwrap();
        let devnum = event.record.devnum().unwrap();
        assert_eq!((devnum.major, devnum.minor), (8, 0));
    }
}
