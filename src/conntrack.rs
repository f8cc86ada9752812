//! Conntrack event source: an NFNETLINK socket subscribed to the NEW
//! and DESTROY multicast groups, plus the zeroing full-table dump used
//! by the refresh timer and at period rollover.

use std::cell::Cell;
use std::fs;
use std::io;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{Error, Result};
use crate::netlink::{self, MessageBuilder, NetlinkSocket};

// linux/netfilter/nfnetlink.h, nfnetlink_conntrack.h
const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;
const IPCTNL_MSG_CT_GET_CTRZERO: u16 = 3;
const NFNLGRP_CONNTRACK_NEW: u32 = 1;
const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;
const NFNETLINK_V0: u8 = 0;
const NFGENMSG_LEN: usize = 4;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
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

const CTA_COUNTERS_PACKETS: u16 = 1;
const CTA_COUNTERS_BYTES: u16 = 2;
const CTA_COUNTERS32_PACKETS: u16 = 3;
const CTA_COUNTERS32_BYTES: u16 = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub pkts: u64,
    pub bytes: u64,
}

/// One direction of a tracked connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tuple {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

/// A parsed conntrack event or dump entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flow {
    pub family: u8,
    /// Whether this came in as a NEW message (freshly observed flow).
    pub new_flow: bool,
    pub orig: Tuple,
    pub reply: Tuple,
    pub orig_counters: Counters,
    pub reply_counters: Counters,
}

/// Outcome of parsing one received datagram.
#[derive(Default)]
pub struct Parsed {
    pub flows: Vec<Flow>,
    /// Dump finished (NLMSG_DONE or an ack).
    pub done: bool,
    /// Errno from an NLMSG_ERROR message.
    pub error: Option<i32>,
}

fn parse_tuple(data: &[u8], family: &mut u8, tuple: &mut Tuple) -> bool {
    let mut have_addrs = false;
    let mut have_proto = false;

    for attr in netlink::attrs(data) {
        match attr.atype {
            CTA_TUPLE_IP => {
                for ip in attr.nested() {
                    match ip.atype {
                        CTA_IP_V4_SRC if ip.payload.len() >= 4 => {
                            *family = libc::AF_INET as u8;
                            tuple.src[..4].copy_from_slice(&ip.payload[..4]);
                            have_addrs = true;
                        }
                        CTA_IP_V4_DST if ip.payload.len() >= 4 => {
                            tuple.dst[..4].copy_from_slice(&ip.payload[..4]);
                        }
                        CTA_IP_V6_SRC if ip.payload.len() >= 16 => {
                            *family = libc::AF_INET6 as u8;
                            tuple.src.copy_from_slice(&ip.payload[..16]);
                            have_addrs = true;
                        }
                        CTA_IP_V6_DST if ip.payload.len() >= 16 => {
                            tuple.dst.copy_from_slice(&ip.payload[..16]);
                        }
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for proto in attr.nested() {
                    match proto.atype {
                        CTA_PROTO_NUM => {
                            if let Some(num) = proto.get_u8() {
                                tuple.proto = num;
                                have_proto = true;
                            }
                        }
                        CTA_PROTO_SRC_PORT => {
                            tuple.src_port = proto.get_be16().unwrap_or(0);
                        }
                        CTA_PROTO_DST_PORT => {
                            tuple.dst_port = proto.get_be16().unwrap_or(0);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    have_addrs && have_proto
}

fn parse_counters(data: &[u8]) -> Counters {
    let mut counters = Counters::default();
    for attr in netlink::attrs(data) {
        match attr.atype {
            CTA_COUNTERS_PACKETS => counters.pkts = attr.get_be64().unwrap_or(0),
            CTA_COUNTERS_BYTES => counters.bytes = attr.get_be64().unwrap_or(0),
            CTA_COUNTERS32_PACKETS => counters.pkts = attr.get_be32().unwrap_or(0) as u64,
            CTA_COUNTERS32_BYTES => counters.bytes = attr.get_be32().unwrap_or(0) as u64,
            _ => {}
        }
    }
    counters
}

fn parse_flow(payload: &[u8], new_flow: bool) -> Option<Flow> {
    if payload.len() < NFGENMSG_LEN {
        return None;
    }

    let mut flow = Flow {
        family: 0,
        new_flow,
        orig: Tuple::default(),
        reply: Tuple::default(),
        orig_counters: Counters::default(),
        reply_counters: Counters::default(),
    };

    let mut have_orig = false;
    let mut have_reply = false;

    for attr in netlink::attrs(&payload[NFGENMSG_LEN..]) {
        match attr.atype {
            CTA_TUPLE_ORIG => {
                have_orig = parse_tuple(attr.payload, &mut flow.family, &mut flow.orig);
            }
            CTA_TUPLE_REPLY => {
                have_reply = parse_tuple(attr.payload, &mut flow.family, &mut flow.reply);
            }
            CTA_COUNTERS_ORIG => {
                flow.orig_counters = parse_counters(attr.payload);
            }
            CTA_COUNTERS_REPLY => {
                flow.reply_counters = parse_counters(attr.payload);
            }
            _ => {}
        }
    }

    (have_orig && have_reply).then_some(flow)
}

/// Walk all netlink messages in a datagram, collecting conntrack flows
/// and dump termination state.
pub fn parse_datagram(buf: &[u8]) -> Parsed {
    let mut parsed = Parsed::default();

    for msg in netlink::messages(buf) {
        match msg.msg_type {
            netlink::NLMSG_NOOP => {}
            netlink::NLMSG_DONE => parsed.done = true,
            netlink::NLMSG_ERROR => {
                let code = msg.error_code();
                if code == 0 {
                    parsed.done = true;
                } else {
                    parsed.error = Some(-code);
                }
            }
            t if t >> 8 == NFNL_SUBSYS_CTNETLINK => {
                let new_flow = t & 0xff == IPCTNL_MSG_CT_NEW;
                if let Some(flow) = parse_flow(msg.payload, new_flow) {
                    parsed.flows.push(flow);
                }
            }
            _ => {}
        }
    }

    parsed
}

fn check_rmem_max(bufsize: usize) {
    let max = fs::read_to_string("/proc/sys/net/core/rmem_max")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(0);

    if bufsize > max {
        log::warn!(
            "netlink receive buffer size of {bufsize} bytes will be capped to {max} bytes \
             by the kernel; raise the net.core.rmem_max sysctl to at least {bufsize} to make \
             the requested size effective"
        );
    }
}

/// The conntrack socket, readable from the event loop.
pub struct Conntrack {
    fd: AsyncFd<NetlinkSocket>,
    seq: Cell<u32>,
}

impl Conntrack {
    pub fn connect(bufsize: usize) -> Result<Conntrack> {
        let sock = NetlinkSocket::connect(libc::NETLINK_NETFILTER)?;

        sock.add_membership(NFNLGRP_CONNTRACK_NEW)?;
        sock.add_membership(NFNLGRP_CONNTRACK_DESTROY)?;

        check_rmem_max(bufsize);
        sock.set_recv_buffer(bufsize)?;
        sock.set_nonblocking()?;

        Ok(Conntrack {
            fd: AsyncFd::with_interest(sock, Interest::READABLE)?,
            seq: Cell::new(1),
        })
    }

    /// Receive one datagram; waits for readability without blocking the
    /// loop.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| fd.get_ref().recv(buf)) {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    /// Kick off a full-table dump with per-flow counter zeroing. The
    /// replies arrive on the same socket and end with NLMSG_DONE.
    pub fn request_dump(&self) -> Result<()> {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));

        let mut req = MessageBuilder::new(
            (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET_CTRZERO,
            netlink::NLM_F_DUMP,
            seq,
        );
        req.append(&[libc::AF_UNSPEC as u8, NFNETLINK_V0, 0, 0]);

        self.fd.get_ref().send(&req.finish()).map_err(Error::from)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};

    /// Builds a conntrack message the way the kernel would emit it.
    pub(crate) fn build_event(
        new_flow: bool,
        orig: (&[u8], u16, &[u8], u16, u8),
        counters: (u64, u64, u64, u64),
    ) -> Vec<u8> {
        let msg_type = if new_flow {
            NFNL_SUBSYS_CTNETLINK << 8 | IPCTNL_MSG_CT_NEW
        } else {
            NFNL_SUBSYS_CTNETLINK << 8 | 2 // IPCTNL_MSG_CT_DELETE
        };
        let (saddr, sport, daddr, dport, proto) = orig;
        let (orig_pkts, orig_bytes, reply_pkts, reply_bytes) = counters;

        let mut b = MessageBuilder::new(msg_type, 0, 1);
        b.append(&[libc::AF_UNSPEC as u8, NFNETLINK_V0, 0, 0]);

        let mut be16 = [0u8; 2];
        let mut be64 = [0u8; 8];

        for (tuple_type, src, sp, dst, dp) in [
            (CTA_TUPLE_ORIG, saddr, sport, daddr, dport),
            (CTA_TUPLE_REPLY, daddr, dport, saddr, sport),
        ] {
            let tuple = b.begin_nest(tuple_type);
            let ip = b.begin_nest(CTA_TUPLE_IP);
            if src.len() == 4 {
                b.put_attr(CTA_IP_V4_SRC, src);
                b.put_attr(CTA_IP_V4_DST, dst);
            } else {
                b.put_attr(CTA_IP_V6_SRC, src);
                b.put_attr(CTA_IP_V6_DST, dst);
            }
            b.end_nest(ip);

            let pr = b.begin_nest(CTA_TUPLE_PROTO);
            b.put_attr(CTA_PROTO_NUM, &[proto]);
            BigEndian::write_u16(&mut be16, sp);
            b.put_attr(CTA_PROTO_SRC_PORT, &be16);
            BigEndian::write_u16(&mut be16, dp);
            b.put_attr(CTA_PROTO_DST_PORT, &be16);
            b.end_nest(pr);
            b.end_nest(tuple);
        }

        for (ctype, pkts, bytes) in [
            (CTA_COUNTERS_ORIG, orig_pkts, orig_bytes),
            (CTA_COUNTERS_REPLY, reply_pkts, reply_bytes),
        ] {
            let nest = b.begin_nest(ctype);
            BigEndian::write_u64(&mut be64, pkts);
            b.put_attr(CTA_COUNTERS_PACKETS, &be64);
            BigEndian::write_u64(&mut be64, bytes);
            b.put_attr(CTA_COUNTERS_BYTES, &be64);
            b.end_nest(nest);
        }

        b.finish()
    }

    #[test]
    fn parses_new_event() {
        let buf = build_event(
            true,
            (&[192, 168, 1, 10], 54321, &[8, 8, 8, 8], 443, 6),
            (1, 64, 1, 1024),
        );

        let parsed = parse_datagram(&buf);
        assert_eq!(parsed.flows.len(), 1);
        assert!(!parsed.done);
        assert!(parsed.error.is_none());

        let flow = &parsed.flows[0];
        assert!(flow.new_flow);
        assert_eq!(flow.family, libc::AF_INET as u8);
        assert_eq!(&flow.orig.src[..4], &[192, 168, 1, 10]);
        assert_eq!(&flow.orig.dst[..4], &[8, 8, 8, 8]);
        assert_eq!(flow.orig.proto, 6);
        assert_eq!(flow.orig.src_port, 54321);
        assert_eq!(flow.orig.dst_port, 443);
        assert_eq!(&flow.reply.src[..4], &[8, 8, 8, 8]);
        assert_eq!(flow.reply.src_port, 443);
        assert_eq!(flow.reply.dst_port, 54321);
        assert_eq!(flow.orig_counters, Counters { pkts: 1, bytes: 64 });
        assert_eq!(
            flow.reply_counters,
            Counters {
                pkts: 1,
                bytes: 1024
            }
        );
    }

    #[test]
    fn parses_destroy_as_existing_flow() {
        let buf = build_event(
            false,
            (&[192, 168, 1, 10], 54321, &[8, 8, 8, 8], 443, 6),
            (2, 100, 2, 2000),
        );
        let parsed = parse_datagram(&buf);
        assert_eq!(parsed.flows.len(), 1);
        assert!(!parsed.flows[0].new_flow);
    }

    #[test]
    fn parses_ipv6_tuples() {
        let src = [0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst = [0x20, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let buf = build_event(true, (&src, 1000, &dst, 53, 17), (1, 80, 1, 120));

        let parsed = parse_datagram(&buf);
        assert_eq!(parsed.flows.len(), 1);
        let flow = &parsed.flows[0];
        assert_eq!(flow.family, libc::AF_INET6 as u8);
        assert_eq!(flow.orig.src, src);
        assert_eq!(flow.reply.dst, src);
    }

    #[test]
    fn detects_done_and_error() {
        let done = MessageBuilder::new(netlink::NLMSG_DONE, 0, 1).finish();
        assert!(parse_datagram(&done).done);

        let mut err = MessageBuilder::new(netlink::NLMSG_ERROR, 0, 1);
        let code = (-libc::ENOBUFS).to_ne_bytes();
        err.append(&code);
        let parsed = parse_datagram(&err.finish());
        assert_eq!(parsed.error, Some(libc::ENOBUFS));
    }

    #[test]
    fn skips_messages_without_tuples() {
        let mut b = MessageBuilder::new(NFNL_SUBSYS_CTNETLINK << 8 | IPCTNL_MSG_CT_NEW, 0, 1);
        b.append(&[libc::AF_UNSPEC as u8, NFNETLINK_V0, 0, 0]);
        let parsed = parse_datagram(&b.finish());
        assert!(parsed.flows.is_empty());
    }
}
