//! Minimal AF_NETLINK plumbing shared by the conntrack source and the
//! neighbour resolver: a raw socket, a request builder and cursors over
//! received messages and attributes. Netlink headers are native-endian;
//! attribute payloads keep whatever byte order the kernel subsystem
//! defines (network order for addresses, ports and counters).

use std::io;
use std::mem;
use std::os::fd::RawFd;

use byteorder::{ByteOrder, NativeEndian};

pub const NLMSG_HDRLEN: usize = 16;
pub const NLA_HDRLEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_DUMP: u16 = 0x100 | 0x200;

const NLA_F_NESTED: u16 = 1 << 15;
const NLA_TYPE_MASK: u16 = 0x3fff;

fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

/// A bound AF_NETLINK socket.
pub struct NetlinkSocket {
    fd: RawFd,
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl std::os::fd::AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl NetlinkSocket {
    pub fn connect(protocol: i32) -> io::Result<NetlinkSocket> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(last_os_error());
        }

        let sock = NetlinkSocket { fd };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_os_error());
        }

        Ok(sock)
    }

    pub fn add_membership(&self, group: u32) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_NETLINK,
                libc::NETLINK_ADD_MEMBERSHIP,
                &group as *const u32 as *const libc::c_void,
                mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub fn set_recv_buffer(&self, bytes: usize) -> io::Result<()> {
        let val = bytes as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &val as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(last_os_error());
        }
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub fn send(&self, msg: &[u8]) -> io::Result<()> {
        let mut peer: libc::sockaddr_nl = unsafe { mem::zeroed() };
        peer.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::sendto(
                self.fd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &peer as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(rc as usize)
    }
}

/// Builds one netlink request: header, fixed family header, attributes
/// with optional nesting.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, flags: u16, seq: u32) -> MessageBuilder {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        NativeEndian::write_u16(&mut buf[4..6], msg_type);
        NativeEndian::write_u16(&mut buf[6..8], flags | NLM_F_REQUEST);
        NativeEndian::write_u32(&mut buf[8..12], seq);
        MessageBuilder { buf }
    }

    /// Appends raw payload (e.g. the fixed nfgenmsg/ndmsg header),
    /// padded to the 4-byte netlink alignment.
    pub fn append(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self.pad();
        self
    }

    pub fn put_attr(&mut self, atype: u16, data: &[u8]) -> &mut Self {
        let mut hdr = [0u8; NLA_HDRLEN];
        NativeEndian::write_u16(&mut hdr[0..2], (NLA_HDRLEN + data.len()) as u16);
        NativeEndian::write_u16(&mut hdr[2..4], atype);
        self.buf.extend_from_slice(&hdr);
        self.buf.extend_from_slice(data);
        self.pad();
        self
    }

    /// Opens a nested attribute; returns a cookie for `end_nest`.
    pub fn begin_nest(&mut self, atype: u16) -> usize {
        let start = self.buf.len();
        let mut hdr = [0u8; NLA_HDRLEN];
        NativeEndian::write_u16(&mut hdr[2..4], atype | NLA_F_NESTED);
        self.buf.extend_from_slice(&hdr);
        start
    }

    pub fn end_nest(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        NativeEndian::write_u16(&mut self.buf[start..start + 2], len);
    }

    fn pad(&mut self) {
        let aligned = align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        NativeEndian::write_u32(&mut self.buf[0..4], len);
        self.buf
    }
}

/// One parsed netlink message within a receive buffer. Sequence
/// numbers are not tracked: multicast events carry none, and dump
/// replies are terminated by NLMSG_DONE instead.
pub struct Message<'a> {
    pub msg_type: u16,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    /// The errno carried by an NLMSG_ERROR message (0 is an ack).
    pub fn error_code(&self) -> i32 {
        if self.payload.len() >= 4 {
            NativeEndian::read_i32(&self.payload[..4])
        } else {
            -libc::EBADMSG
        }
    }
}

/// Iterates the netlink messages inside one received datagram.
pub fn messages(buf: &[u8]) -> MessageIter<'_> {
    MessageIter { buf }
}

pub struct MessageIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Message<'a>;

    fn next(&mut self) -> Option<Message<'a>> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }

        let len = NativeEndian::read_u32(&self.buf[0..4]) as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            return None;
        }

        let msg = Message {
            msg_type: NativeEndian::read_u16(&self.buf[4..6]),
            payload: &self.buf[NLMSG_HDRLEN..len],
        };

        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Some(msg)
    }
}

/// One netlink attribute.
pub struct Attr<'a> {
    pub atype: u16,
    pub payload: &'a [u8],
}

impl<'a> Attr<'a> {
    pub fn nested(&self) -> AttrIter<'a> {
        attrs(self.payload)
    }

    pub fn get_u8(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// 16-bit payload in network byte order (ports).
    pub fn get_be16(&self) -> Option<u16> {
        (self.payload.len() >= 2).then(|| byteorder::BigEndian::read_u16(&self.payload[..2]))
    }

    /// 32-bit payload in network byte order (legacy counters).
    pub fn get_be32(&self) -> Option<u32> {
        (self.payload.len() >= 4).then(|| byteorder::BigEndian::read_u32(&self.payload[..4]))
    }

    /// 64-bit payload in network byte order (counters).
    pub fn get_be64(&self) -> Option<u64> {
        (self.payload.len() >= 8).then(|| byteorder::BigEndian::read_u64(&self.payload[..8]))
    }
}

/// Iterates a run of netlink attributes.
pub fn attrs(data: &[u8]) -> AttrIter<'_> {
    AttrIter { buf: data }
}

pub struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Attr<'a>;

    fn next(&mut self) -> Option<Attr<'a>> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }

        let len = NativeEndian::read_u16(&self.buf[0..2]) as usize;
        if len < NLA_HDRLEN || len > self.buf.len() {
            return None;
        }

        let attr = Attr {
            atype: NativeEndian::read_u16(&self.buf[2..4]) & NLA_TYPE_MASK,
            payload: &self.buf[NLA_HDRLEN..len],
        };

        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Some(attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_roundtrip() {
        let mut b = MessageBuilder::new(42, NLM_F_DUMP, 7);
        b.append(&[1, 0, 0, 0]);
        let nest = b.begin_nest(1);
        b.put_attr(2, &[0xab, 0xcd]);
        b.end_nest(nest);
        b.put_attr(3, &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x01]);
        let buf = b.finish();

        let mut msgs = messages(&buf);
        let msg = msgs.next().unwrap();
        assert!(msgs.next().is_none());
        assert_eq!(msg.msg_type, 42);

        // skip the fixed header, then walk the attributes
        let mut it = attrs(&msg.payload[4..]);
        let nest = it.next().unwrap();
        assert_eq!(nest.atype, 1);
        let inner = nest.nested().next().unwrap();
        assert_eq!(inner.atype, 2);
        assert_eq!(inner.get_be16(), Some(0xabcd));

        let counter = it.next().unwrap();
        assert_eq!(counter.atype, 3);
        assert_eq!(counter.get_be64(), Some(0xdeadbeef_00000001));
        assert!(it.next().is_none());
    }

    #[test]
    fn attr_iter_stops_on_garbage() {
        // length smaller than the attribute header
        let buf = [2u8, 0, 1, 0];
        assert!(attrs(&buf).next().is_none());

        // length past the end of the buffer
        let buf = [200u8, 0, 1, 0, 0, 0];
        assert!(attrs(&buf).next().is_none());
    }
}
