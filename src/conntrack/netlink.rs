//! `NETLINK_NETFILTER` transport: the listen (multicast) and poll (dump)
//! conntrack sources described in §4.2. Parsing of individual messages is
//! delegated to [`super::message`]; this module only owns socket framing.

use super::message::{parse_ctnetlink_message, ConntrackSample, NFGENMSG_LEN};
use async_trait::async_trait;
use netlink_sys::{protocols::NETLINK_NETFILTER, Socket, SocketAddr};
use std::os::fd::AsRawFd;

#[derive(Debug, thiserror::Error)]
pub enum ConntrackError {
    #[error("failed to open netfilter netlink socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("failed to enlarge the listen socket receive buffer: {0}")]
    RcvBuf(#[source] std::io::Error),
    #[error("netfilter netlink I/O error: {0}")]
    Io(#[source] std::io::Error),
}

pub type ConntrackResult<T> = Result<T, ConntrackError>;

const NFNL_SUBSYS_CTNETLINK: u8 = 1;
const IPCTNL_MSG_CT_GET: u8 = 1;

// Multicast group numbers from <linux/netfilter/nfnetlink_compat.h>.
const NFNLGRP_CONNTRACK_NEW: u32 = 1;
const NFNLGRP_CONNTRACK_UPDATE: u32 = 2;
const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x100 | 0x200; // NLM_F_ROOT | NLM_F_MATCH
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLMSG_HDRLEN: usize = 16;

/// Minimum listen-socket receive buffer, per §4.2.
pub const MIN_RCVBUF_BYTES: i32 = 2 * 1024 * 1024;

/// One parsed message off the wire, tagged with whether it came from the
/// dump (poll) path so the monitor can synthesize "update" kind uniformly.
pub struct RawMessage {
    pub nlmsg_type: u16,
    pub body: Vec<u8>,
}

fn build_header(nlmsg_type: u16, flags: u16, seq: u32, body_len: usize) -> Vec<u8> {
    let total_len = (NLMSG_HDRLEN + body_len) as u32;
    let mut buf = Vec::with_capacity(NLMSG_HDRLEN);
    buf.extend_from_slice(&total_len.to_ne_bytes());
    buf.extend_from_slice(&nlmsg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid, kernel assigns
    buf
}

fn ct_get_dump_request(seq: u32) -> Vec<u8> {
    let nlmsg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | IPCTNL_MSG_CT_GET as u16;
    // nfgenmsg: family = AF_UNSPEC(0), version = NFNETLINK_V0(0), res_id = 0 (be16)
    let nfgenmsg = [0u8; NFGENMSG_LEN];
    let mut msg = build_header(nlmsg_type, NLM_F_REQUEST | NLM_F_DUMP, seq, nfgenmsg.len());
    msg.extend_from_slice(&nfgenmsg);
    msg
}

fn set_rcvbuf(socket: &Socket, bytes: i32) -> std::io::Result<()> {
    let fd = socket.as_raw_fd();
    for opt in [libc::SO_RCVBUFFORCE, libc::SO_RCVBUF] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &bytes as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            return Ok(());
        }
    }
    Err(std::io::Error::last_os_error())
}

/// Walk one or more netlink messages out of a raw receive buffer.
fn split_messages(buf: &[u8]) -> Vec<RawMessage> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let nlmsg_type = u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            break;
        }
        if nlmsg_type != NLMSG_NOOP && nlmsg_type != NLMSG_ERROR && nlmsg_type != NLMSG_DONE {
            out.push(RawMessage {
                nlmsg_type,
                body: buf[offset + NLMSG_HDRLEN..offset + len].to_vec(),
            });
        }
        offset += (len + 3) & !3;
    }
    out
}

/// The multicast listen source. Owned exclusively by the listen worker —
/// no other task ever touches this socket.
#[async_trait]
pub trait ListenTransport: Send {
    async fn recv_listen(&mut self) -> ConntrackResult<Vec<ConntrackSample>>;
}

/// The periodic `CT_GET` dump source. Owned exclusively by the poll worker.
/// Per §4.2 this must be "a second, independent connection" from the listen
/// socket so a dump in flight can never block delivery of multicast events.
#[async_trait]
pub trait DumpTransport: Send {
    async fn dump(&mut self) -> ConntrackResult<Vec<ConntrackSample>>;
}

/// Real listen-side transport: the socket bound to the conntrack multicast
/// groups.
pub struct NetlinkListenTransport {
    listen: Socket,
}

impl NetlinkListenTransport {
    fn open() -> ConntrackResult<Self> {
        let mut listen = Socket::new(NETLINK_NETFILTER).map_err(ConntrackError::Socket)?;
        let groups = (1 << (NFNLGRP_CONNTRACK_NEW - 1))
            | (1 << (NFNLGRP_CONNTRACK_UPDATE - 1))
            | (1 << (NFNLGRP_CONNTRACK_DESTROY - 1));
        listen
            .bind(&SocketAddr::new(0, groups))
            .map_err(ConntrackError::Socket)?;
        set_rcvbuf(&listen, MIN_RCVBUF_BYTES).map_err(ConntrackError::RcvBuf)?;
        Ok(Self { listen })
    }
}

#[async_trait]
impl ListenTransport for NetlinkListenTransport {
    async fn recv_listen(&mut self) -> ConntrackResult<Vec<ConntrackSample>> {
        let mut buf = vec![0u8; 1 << 16];
        let len = tokio::task::block_in_place(|| self.listen.recv(&mut buf, 0))
            .map_err(ConntrackError::Io)?;
        Ok(split_messages(&buf[..len])
            .into_iter()
            .filter_map(|m| parse_ctnetlink_message(m.nlmsg_type, &m.body))
            .collect())
    }
}

/// Real dump-side transport. Opens a brand new socket for every tick, so it
/// never shares a file descriptor — let alone a lock — with the listen side.
#[derive(Default)]
pub struct NetlinkDumpTransport {
    dump_seq: u32,
}

#[async_trait]
impl DumpTransport for NetlinkDumpTransport {
    async fn dump(&mut self) -> ConntrackResult<Vec<ConntrackSample>> {
        self.dump_seq = self.dump_seq.wrapping_add(1);
        let seq = self.dump_seq;
        tokio::task::spawn_blocking(move || {
            let mut socket = Socket::new(NETLINK_NETFILTER).map_err(ConntrackError::Socket)?;
            socket
                .bind(&SocketAddr::new(0, 0))
                .map_err(ConntrackError::Socket)?;
            let request = ct_get_dump_request(seq);
            socket.send(&request, 0).map_err(ConntrackError::Io)?;

            let mut samples = Vec::new();
            let mut buf = vec![0u8; 1 << 16];
            loop {
                let len = socket.recv(&mut buf, 0).map_err(ConntrackError::Io)?;
                if len == 0 {
                    break;
                }
                let messages = split_messages(&buf[..len]);
                let saw_done = done_marker_present(&buf[..len]);
                for msg in messages {
                    if let Some(sample) = parse_ctnetlink_message(msg.nlmsg_type, &msg.body) {
                        samples.push(sample);
                    }
                }
                if saw_done {
                    break;
                }
            }
            Ok(samples)
        })
        .await
        .map_err(|e| ConntrackError::Io(std::io::Error::other(e)))?
    }
}

/// Open both real transport halves — the listen socket (fallible, bound up
/// front) and the dump side (stateless until the first tick).
pub fn open_transports() -> ConntrackResult<(NetlinkListenTransport, NetlinkDumpTransport)> {
    Ok((NetlinkListenTransport::open()?, NetlinkDumpTransport::default()))
}

fn done_marker_present(buf: &[u8]) -> bool {
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let nlmsg_type = u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            break;
        }
        if nlmsg_type == NLMSG_DONE || nlmsg_type == NLMSG_ERROR {
            return true;
        }
        offset += (len + 3) & !3;
    }
    false
}

/// In-memory listen-side transport for tests: pre-scripted batches drained
/// one per call.
#[cfg(test)]
#[derive(Default)]
pub struct MockListenTransport {
    pub batches: std::collections::VecDeque<Vec<ConntrackSample>>,
}

#[cfg(test)]
#[async_trait]
impl ListenTransport for MockListenTransport {
    async fn recv_listen(&mut self) -> ConntrackResult<Vec<ConntrackSample>> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

/// In-memory dump-side transport for tests, same shape as
/// [`MockListenTransport`] but for the poll path.
#[cfg(test)]
#[derive(Default)]
pub struct MockDumpTransport {
    pub batches: std::collections::VecDeque<Vec<ConntrackSample>>,
}

#[cfg(test)]
#[async_trait]
impl DumpTransport for MockDumpTransport {
    async fn dump(&mut self) -> ConntrackResult<Vec<ConntrackSample>> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}
