//! Hand-rolled parsing of `NETLINK_NETFILTER` / `NFNL_SUBSYS_CTNETLINK`
//! messages into `ConntrackSample`s. The netfilter ctnetlink wire format
//! predates the generic typed-attribute crates used for `NETLINK_ROUTE`, so
//! this walks the TLV attribute stream directly — the same approach real
//! conntrack tooling takes when it isn't going through `libnetfilter_conntrack`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const NFNL_SUBSYS_CTNETLINK: u8 = 1;
const IPCTNL_MSG_CT_NEW: u8 = 0;
const IPCTNL_MSG_CT_GET: u8 = 1;
const IPCTNL_MSG_CT_DELETE: u8 = 2;

pub(super) const NFGENMSG_LEN: usize = 4;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
const CTA_ID: u16 = 12;
const CTA_COUNTERS_ORIG: u16 = 9;
const CTA_COUNTERS_REPLY: u16 = 10;

const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const CTA_COUNTERS_BYTES: u16 = 2;

const NLA_TYPE_MASK: u16 = 0x3fff;

/// A single conntrack sample as read off the wire: the 5-tuple, the
/// kernel's flow-id, and the cumulative per-direction byte counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConntrackSample {
    pub flow_id: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub origin_bytes: u64,
    pub reply_bytes: u64,
    pub destroy: bool,
}

#[derive(Debug, Default)]
struct Tuple {
    ip: Option<(IpAddr, IpAddr)>,
    proto: Option<u8>,
    src_port: u16,
    dst_port: u16,
}

/// Walk a netlink attribute (NLA) TLV stream: `len:u16, type:u16, value`,
/// 4-byte aligned, `len` includes the 4-byte header.
fn iter_nlas(buf: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset + 4 > buf.len() {
            return None;
        }
        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let kind = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]) & NLA_TYPE_MASK;
        if len < 4 || offset + len > buf.len() {
            return None;
        }
        let value = &buf[offset + 4..offset + len];
        offset += (len + 3) & !3;
        Some((kind, value))
    })
}

fn parse_tuple(buf: &[u8]) -> Tuple {
    let mut tuple = Tuple::default();
    for (kind, value) in iter_nlas(buf) {
        match kind {
            CTA_TUPLE_IP => {
                let mut src = None;
                let mut dst = None;
                for (ip_kind, ip_value) in iter_nlas(value) {
                    match ip_kind {
                        CTA_IP_V4_SRC if ip_value.len() == 4 => {
                            src = Some(IpAddr::V4(Ipv4Addr::new(
                                ip_value[0],
                                ip_value[1],
                                ip_value[2],
                                ip_value[3],
                            )));
                        }
                        CTA_IP_V4_DST if ip_value.len() == 4 => {
                            dst = Some(IpAddr::V4(Ipv4Addr::new(
                                ip_value[0],
                                ip_value[1],
                                ip_value[2],
                                ip_value[3],
                            )));
                        }
                        CTA_IP_V6_SRC if ip_value.len() == 16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(ip_value);
                            src = Some(IpAddr::V6(Ipv6Addr::from(octets)));
                        }
                        CTA_IP_V6_DST if ip_value.len() == 16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(ip_value);
                            dst = Some(IpAddr::V6(Ipv6Addr::from(octets)));
                        }
                        _ => {}
                    }
                }
                if let (Some(s), Some(d)) = (src, dst) {
                    tuple.ip = Some((s, d));
                }
            }
            CTA_TUPLE_PROTO => {
                for (proto_kind, proto_value) in iter_nlas(value) {
                    match proto_kind {
                        CTA_PROTO_NUM if !proto_value.is_empty() => {
                            tuple.proto = Some(proto_value[0]);
                        }
                        CTA_PROTO_SRC_PORT if proto_value.len() == 2 => {
                            tuple.src_port = u16::from_be_bytes([proto_value[0], proto_value[1]]);
                        }
                        CTA_PROTO_DST_PORT if proto_value.len() == 2 => {
                            tuple.dst_port = u16::from_be_bytes([proto_value[0], proto_value[1]]);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    tuple
}

fn parse_counters(buf: &[u8]) -> u64 {
    for (kind, value) in iter_nlas(buf) {
        if kind == CTA_COUNTERS_BYTES && value.len() == 8 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(value);
            return u64::from_be_bytes(bytes);
        }
    }
    0
}

/// Parse one complete netlink message body (nfgenmsg header + CTA_*
/// attributes) into a sample. `nlmsg_type` is the raw `nlmsghdr.nlmsg_type`
/// field; only `NFNL_SUBSYS_CTNETLINK` new/delete messages yield a sample.
pub fn parse_ctnetlink_message(nlmsg_type: u16, body: &[u8]) -> Option<ConntrackSample> {
    let subsys = (nlmsg_type >> 8) as u8;
    let msg_type = (nlmsg_type & 0xff) as u8;
    if subsys != NFNL_SUBSYS_CTNETLINK {
        return None;
    }
    let destroy = match msg_type {
        IPCTNL_MSG_CT_NEW | IPCTNL_MSG_CT_GET => false,
        IPCTNL_MSG_CT_DELETE => true,
        _ => return None,
    };

    if body.len() < NFGENMSG_LEN {
        return None;
    }
    let attrs = &body[NFGENMSG_LEN..];

    let mut flow_id = None;
    let mut origin_tuple: Option<Tuple> = None;
    let mut origin_bytes = 0u64;
    let mut reply_bytes = 0u64;

    for (kind, value) in iter_nlas(attrs) {
        match kind {
            CTA_TUPLE_ORIG => origin_tuple = Some(parse_tuple(value)),
            CTA_COUNTERS_ORIG => origin_bytes = parse_counters(value),
            CTA_COUNTERS_REPLY => reply_bytes = parse_counters(value),
            CTA_ID if value.len() == 4 => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(value);
                flow_id = Some(u32::from_be_bytes(bytes));
            }
            _ => {}
        }
    }

    let tuple = origin_tuple?;
    let (src_ip, dst_ip) = tuple.ip?;
    let protocol = tuple.proto?;

    Some(ConntrackSample {
        flow_id: flow_id?,
        src_ip,
        dst_ip,
        src_port: tuple.src_port,
        dst_port: tuple.dst_port,
        protocol,
        origin_bytes,
        reply_bytes,
        destroy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_nla(buf: &mut Vec<u8>, kind: u16, value: &[u8]) {
        let len = (4 + value.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(value);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    fn sample_body(flow_id: u32, origin_bytes: u64, reply_bytes: u64) -> Vec<u8> {
        let mut ip = Vec::new();
        push_nla(&mut ip, CTA_IP_V4_SRC, &[192, 168, 1, 10]);
        push_nla(&mut ip, CTA_IP_V4_DST, &[8, 8, 8, 8]);

        let mut proto = Vec::new();
        push_nla(&mut proto, CTA_PROTO_NUM, &[6]);
        push_nla(&mut proto, CTA_PROTO_SRC_PORT, &55000u16.to_be_bytes());
        push_nla(&mut proto, CTA_PROTO_DST_PORT, &443u16.to_be_bytes());

        let mut tuple = Vec::new();
        push_nla(&mut tuple, CTA_TUPLE_IP, &ip);
        push_nla(&mut tuple, CTA_TUPLE_PROTO, &proto);

        let mut origin_counters = Vec::new();
        push_nla(&mut origin_counters, CTA_COUNTERS_BYTES, &origin_bytes.to_be_bytes());
        let mut reply_counters = Vec::new();
        push_nla(&mut reply_counters, CTA_COUNTERS_BYTES, &reply_bytes.to_be_bytes());

        let mut attrs = Vec::new();
        push_nla(&mut attrs, CTA_TUPLE_ORIG, &tuple);
        push_nla(&mut attrs, CTA_COUNTERS_ORIG, &origin_counters);
        push_nla(&mut attrs, CTA_COUNTERS_REPLY, &reply_counters);
        push_nla(&mut attrs, CTA_ID, &flow_id.to_be_bytes());

        let mut body = vec![0u8; NFGENMSG_LEN];
        body.extend_from_slice(&attrs);
        body
    }

    #[test]
    fn parses_new_message() {
        let body = sample_body(7, 10_000, 20_000);
        let nlmsg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | IPCTNL_MSG_CT_NEW as u16;
        let sample = parse_ctnetlink_message(nlmsg_type, &body).unwrap();
        assert_eq!(sample.flow_id, 7);
        assert_eq!(sample.src_ip, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(sample.dst_ip, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(sample.src_port, 55000);
        assert_eq!(sample.dst_port, 443);
        assert_eq!(sample.protocol, 6);
        assert_eq!(sample.origin_bytes, 10_000);
        assert_eq!(sample.reply_bytes, 20_000);
        assert!(!sample.destroy);
    }

    #[test]
    fn parses_delete_message_as_destroy() {
        let body = sample_body(9, 100, 200);
        let nlmsg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | IPCTNL_MSG_CT_DELETE as u16;
        let sample = parse_ctnetlink_message(nlmsg_type, &body).unwrap();
        assert!(sample.destroy);
    }

    #[test]
    fn ignores_non_ctnetlink_subsystem() {
        let body = sample_body(1, 1, 1);
        let nlmsg_type = 0x0200u16;
        assert!(parse_ctnetlink_message(nlmsg_type, &body).is_none());
    }

    #[test]
    fn missing_tuple_yields_none() {
        let mut body = vec![0u8; NFGENMSG_LEN];
        let mut attrs = Vec::new();
        push_nla(&mut attrs, CTA_ID, &1u32.to_be_bytes());
        body.extend_from_slice(&attrs);
        let nlmsg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | IPCTNL_MSG_CT_NEW as u16;
        assert!(parse_ctnetlink_message(nlmsg_type, &body).is_none());
    }
}
