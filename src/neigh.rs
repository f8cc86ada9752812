//! Neighbour resolver: maps a local IP to its hardware address via the
//! OS neighbour table, with a link-address fallback for the router's
//! own interface addresses, and caches the results.

use std::collections::HashMap;

use byteorder::{ByteOrder, NativeEndian};

use crate::error::{Error, Result};
use crate::netlink::{self, MessageBuilder, NetlinkSocket};

// linux/rtnetlink.h, linux/neighbour.h, linux/if_addr.h, linux/if_link.h
const RTM_NEWLINK: u16 = 16;
const RTM_GETLINK: u16 = 18;
const RTM_NEWADDR: u16 = 20;
const RTM_GETADDR: u16 = 22;
const RTM_NEWNEIGH: u16 = 28;
const RTM_GETNEIGH: u16 = 30;

const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

const NUD_INCOMPLETE: u16 = 0x01;
const NUD_FAILED: u16 = 0x20;
const NUD_NOARP: u16 = 0x40;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const IFLA_ADDRESS: u16 = 1;

const NDMSG_LEN: usize = 12;
const IFADDRMSG_LEN: usize = 8;
const IFINFOMSG_LEN: usize = 16;

const RECV_BUF: usize = 32768;

fn addr_len(family: u8) -> usize {
    if family == libc::AF_INET6 as u8 {
        16
    } else {
        4
    }
}

pub struct Neighbors {
    sock: NetlinkSocket,
    seq: u32,
    cache: HashMap<(u8, [u8; 16]), [u8; 6]>,
}

impl Neighbors {
    pub fn connect() -> Result<Neighbors> {
        Ok(Neighbors {
            sock: NetlinkSocket::connect(libc::NETLINK_ROUTE)?,
            seq: 1,
            cache: HashMap::new(),
        })
    }

    pub fn lookup(&self, family: u8, addr: &[u8; 16]) -> Option<[u8; 6]> {
        self.cache.get(&(family, *addr)).copied()
    }

    /// Query the OS for `addr`'s hardware address and cache it.
    /// `NotFound` when neither the neighbour table nor the interface
    /// list knows the address.
    pub fn refresh(&mut self, family: u8, addr: &[u8; 16]) -> Result<()> {
        let mac = match self.query_neighbor(family, addr)? {
            Some(mac) => Some(mac),
            None => match self.query_ifindex(family, addr)? {
                Some(ifindex) => self.query_link(ifindex)?,
                None => None,
            },
        };

        match mac {
            Some(mac) => {
                self.cache.insert((family, *addr), mac);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = seq.wrapping_add(1);
        seq
    }

    /// Runs one dump request and feeds every reply message to `f` until
    /// the kernel signals the end of the dump.
    fn dump<F: FnMut(&netlink::Message<'_>)>(&mut self, req: Vec<u8>, mut f: F) -> Result<()> {
        self.sock.send(&req)?;

        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let len = self.sock.recv(&mut buf)?;
            for msg in netlink::messages(&buf[..len]) {
                match msg.msg_type {
                    netlink::NLMSG_DONE => return Ok(()),
                    netlink::NLMSG_ERROR => return Ok(()),
                    _ => f(&msg),
                }
            }
        }
    }

    fn query_neighbor(&mut self, family: u8, addr: &[u8; 16]) -> Result<Option<[u8; 6]>> {
        let mut req = MessageBuilder::new(RTM_GETNEIGH, netlink::NLM_F_DUMP, self.next_seq());
        let mut ndmsg = [0u8; NDMSG_LEN];
        ndmsg[0] = family;
        req.append(&ndmsg);

        let len = addr_len(family);
        let mut found: Option<[u8; 6]> = None;

        self.dump(req.finish(), |msg| {
            if msg.msg_type != RTM_NEWNEIGH || msg.payload.len() < NDMSG_LEN {
                return;
            }
            if msg.payload[0] != family {
                return;
            }

            let state = NativeEndian::read_u16(&msg.payload[8..10]);
            if state & (NUD_NOARP | NUD_FAILED | NUD_INCOMPLETE) != 0 {
                return;
            }

            let mut dst: Option<&[u8]> = None;
            let mut lladdr: Option<&[u8]> = None;
            for attr in netlink::attrs(&msg.payload[NDMSG_LEN..]) {
                match attr.atype {
                    NDA_DST => dst = Some(attr.payload),
                    NDA_LLADDR => lladdr = Some(attr.payload),
                    _ => {}
                }
            }

            let (Some(dst), Some(lladdr)) = (dst, lladdr) else {
                return;
            };
            if dst.len() != len || dst != &addr[..len] {
                return;
            }
            if lladdr.len() > 6 || lladdr.iter().all(|&b| b == 0) {
                return;
            }

            let mut mac = [0u8; 6];
            mac[..lladdr.len()].copy_from_slice(lladdr);
            found = Some(mac);
        })?;

        Ok(found)
    }

    fn query_ifindex(&mut self, family: u8, addr: &[u8; 16]) -> Result<Option<i32>> {
        let mut req = MessageBuilder::new(RTM_GETADDR, netlink::NLM_F_DUMP, self.next_seq());
        let mut ifaddrmsg = [0u8; IFADDRMSG_LEN];
        ifaddrmsg[0] = family;
        req.append(&ifaddrmsg);

        let len = addr_len(family);
        let mut found: Option<i32> = None;

        self.dump(req.finish(), |msg| {
            if msg.msg_type != RTM_NEWADDR || msg.payload.len() < IFADDRMSG_LEN {
                return;
            }
            if msg.payload[0] != family {
                return;
            }

            let ifindex = NativeEndian::read_u32(&msg.payload[4..8]) as i32;

            let mut local: Option<&[u8]> = None;
            let mut address: Option<&[u8]> = None;
            for attr in netlink::attrs(&msg.payload[IFADDRMSG_LEN..]) {
                match attr.atype {
                    IFA_LOCAL => local = Some(attr.payload),
                    IFA_ADDRESS => address = Some(attr.payload),
                    _ => {}
                }
            }

            let Some(candidate) = local.or(address) else {
                return;
            };
            if candidate.len() == len && candidate == &addr[..len] {
                found = Some(ifindex);
            }
        })?;

        Ok(found)
    }

    fn query_link(&mut self, ifindex: i32) -> Result<Option<[u8; 6]>> {
        let mut req = MessageBuilder::new(RTM_GETLINK, 0, self.next_seq());
        let mut ifinfomsg = [0u8; IFINFOMSG_LEN];
        NativeEndian::write_i32(&mut ifinfomsg[4..8], ifindex);
        req.append(&ifinfomsg);
        self.sock.send(&req.finish())?;

        let mut buf = vec![0u8; RECV_BUF];
        let len = self.sock.recv(&mut buf)?;

        for msg in netlink::messages(&buf[..len]) {
            if msg.msg_type != RTM_NEWLINK || msg.payload.len() < IFINFOMSG_LEN {
                continue;
            }

            for attr in netlink::attrs(&msg.payload[IFINFOMSG_LEN..]) {
                if attr.atype != IFLA_ADDRESS || attr.payload.len() > 6 {
                    continue;
                }
                let mut mac = [0u8; 6];
                mac[..attr.payload.len()].copy_from_slice(attr.payload);
                return Ok(Some(mac));
            }
        }

        Ok(None)
    }

    /// Seed the cache directly; used by tests and nothing else at
    /// runtime.
    #[cfg(test)]
    pub fn cache_insert(&mut self, family: u8, addr: [u8; 16], mac: [u8; 6]) {
        self.cache.insert((family, addr), mac);
    }
}
