use std::cmp::Ordering;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// On-wire / on-disk size of one record.
pub const RECORD_SIZE: usize = 68;

/// One aggregation bucket: traffic of a local host towards one
/// (protocol, destination port) pair.
///
/// The wire layout is identity-first: family, proto, dst_port (BE),
/// src_mac padded to 8 bytes, a 16-byte address slot (IPv4
/// left-justified), then five big-endian u64 counters. Two records
/// describe the same flow key iff their identity prefixes are
/// byte-equal; since all integers are unsigned and big-endian on the
/// wire, comparing the struct fields numerically is equivalent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub family: u8,
    pub proto: u8,
    pub dst_port: u16,
    pub src_mac: [u8; 6],
    pub src_addr: [u8; 16],
    pub count: u64,
    pub out_pkts: u64,
    pub out_bytes: u64,
    pub in_pkts: u64,
    pub in_bytes: u64,
}

impl Record {
    pub fn is_ipv4(&self) -> bool {
        self.family == libc::AF_INET as u8
    }

    /// Total order over the identity prefix, byte-compatible with the
    /// wire form.
    pub fn cmp_identity(&self, other: &Record) -> Ordering {
        (self.family, self.proto, self.dst_port, self.src_mac, self.src_addr).cmp(&(
            other.family,
            other.proto,
            other.dst_port,
            other.src_mac,
            other.src_addr,
        ))
    }

    /// Full-record order: identity, then counters in wire order. Used
    /// as the deterministic tie-break after a sort projection.
    pub fn cmp_full(&self, other: &Record) -> Ordering {
        self.cmp_identity(other).then_with(|| {
            (
                self.count,
                self.out_pkts,
                self.out_bytes,
                self.in_pkts,
                self.in_bytes,
            )
                .cmp(&(
                    other.count,
                    other.out_pkts,
                    other.out_bytes,
                    other.in_pkts,
                    other.in_bytes,
                ))
        })
    }

    /// Add all five counters of `other` into `self`.
    pub fn merge(&mut self, other: &Record) {
        self.count = self.count.wrapping_add(other.count);
        self.out_pkts = self.out_pkts.wrapping_add(other.out_pkts);
        self.out_bytes = self.out_bytes.wrapping_add(other.out_bytes);
        self.in_pkts = self.in_pkts.wrapping_add(other.in_pkts);
        self.in_bytes = self.in_bytes.wrapping_add(other.in_bytes);
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.family)?;
        w.write_u8(self.proto)?;
        w.write_u16::<BigEndian>(self.dst_port)?;
        w.write_all(&self.src_mac)?;
        w.write_all(&[0u8; 2])?;
        w.write_all(&self.src_addr)?;
        w.write_u64::<BigEndian>(self.count)?;
        w.write_u64::<BigEndian>(self.out_pkts)?;
        w.write_u64::<BigEndian>(self.out_bytes)?;
        w.write_u64::<BigEndian>(self.in_pkts)?;
        w.write_u64::<BigEndian>(self.in_bytes)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Record> {
        let mut rec = Record {
            family: r.read_u8()?,
            proto: r.read_u8()?,
            dst_port: r.read_u16::<BigEndian>()?,
            ..Record::default()
        };
        r.read_exact(&mut rec.src_mac)?;
        let mut pad = [0u8; 2];
        r.read_exact(&mut pad)?;
        r.read_exact(&mut rec.src_addr)?;
        rec.count = r.read_u64::<BigEndian>()?;
        rec.out_pkts = r.read_u64::<BigEndian>()?;
        rec.out_bytes = r.read_u64::<BigEndian>()?;
        rec.in_pkts = r.read_u64::<BigEndian>()?;
        rec.in_bytes = r.read_u64::<BigEndian>()?;
        Ok(rec)
    }
}

/// Field tags selectable in the client's group and sort projections.
///
/// `Host` spans the (mac, ip) range and `Layer7` the (proto, port)
/// range, so grouping by them aggregates over the combined fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Family,
    Proto,
    Port,
    Mac,
    Ip,
    Conns,
    RxBytes,
    RxPkts,
    TxBytes,
    TxPkts,
    Host,
    Layer7,
}

/// Output column order for the expanded (json/csv) renderings.
pub const COLUMNS: [Field; 10] = [
    Field::Family,
    Field::Proto,
    Field::Port,
    Field::Mac,
    Field::Ip,
    Field::Conns,
    Field::RxBytes,
    Field::RxPkts,
    Field::TxBytes,
    Field::TxPkts,
];

impl Field {
    pub fn parse(name: &str) -> Option<Field> {
        Some(match name {
            "family" => Field::Family,
            "proto" => Field::Proto,
            "port" => Field::Port,
            "mac" => Field::Mac,
            "ip" => Field::Ip,
            "conns" => Field::Conns,
            "rx_bytes" => Field::RxBytes,
            "rx_pkts" => Field::RxPkts,
            "tx_bytes" => Field::TxBytes,
            "tx_pkts" => Field::TxPkts,
            "host" => Field::Host,
            "layer7" => Field::Layer7,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Family => "family",
            Field::Proto => "proto",
            Field::Port => "port",
            Field::Mac => "mac",
            Field::Ip => "ip",
            Field::Conns => "conns",
            Field::RxBytes => "rx_bytes",
            Field::RxPkts => "rx_pkts",
            Field::TxBytes => "tx_bytes",
            Field::TxPkts => "tx_pkts",
            Field::Host => "host",
            Field::Layer7 => "layer7",
        }
    }

    /// Compare one field range of two records, byte-compatible with
    /// the wire form.
    pub fn compare(self, a: &Record, b: &Record) -> Ordering {
        match self {
            Field::Family => a.family.cmp(&b.family),
            Field::Proto => a.proto.cmp(&b.proto),
            Field::Port => a.dst_port.cmp(&b.dst_port),
            Field::Mac => a.src_mac.cmp(&b.src_mac),
            Field::Ip => a.src_addr.cmp(&b.src_addr),
            Field::Conns => a.count.cmp(&b.count),
            Field::RxBytes => a.in_bytes.cmp(&b.in_bytes),
            Field::RxPkts => a.in_pkts.cmp(&b.in_pkts),
            Field::TxBytes => a.out_bytes.cmp(&b.out_bytes),
            Field::TxPkts => a.out_pkts.cmp(&b.out_pkts),
            Field::Host => (a.src_mac, a.src_addr).cmp(&(b.src_mac, b.src_addr)),
            Field::Layer7 => (a.proto, a.dst_port).cmp(&(b.proto, b.dst_port)),
        }
    }
}

/// One element of a sort projection.
#[derive(Clone, Copy, Debug)]
pub struct SortKey {
    pub field: Field,
    pub descending: bool,
}

/// Lexicographic comparison over the selected field ranges only.
pub fn compare_group(a: &Record, b: &Record, group: &[Field]) -> Ordering {
    for field in group {
        let ord = field.compare(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Sort-projection comparison with full-record tie-break, so the
/// presentation order is deterministic when keys tie.
pub fn compare_sort(a: &Record, b: &Record, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let ord = key.field.compare(a, b);
        if ord != Ordering::Equal {
            return if key.descending { ord.reverse() } else { ord };
        }
    }
    a.cmp_full(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            family: libc::AF_INET as u8,
            proto: 6,
            dst_port: 443,
            src_mac: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            src_addr: {
                let mut a = [0u8; 16];
                a[..4].copy_from_slice(&[192, 168, 1, 10]);
                a
            },
            count: 1,
            out_pkts: 2,
            out_bytes: 128,
            in_pkts: 3,
            in_bytes: 4096,
        }
    }

    #[test]
    fn wire_roundtrip() {
        let rec = sample();
        let mut buf = Vec::new();
        rec.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), RECORD_SIZE);
        // identity prefix: family, proto, BE port, padded mac, addr
        assert_eq!(&buf[..4], &[libc::AF_INET as u8, 6, 0x01, 0xbb]);
        assert_eq!(&buf[4..12], &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0, 0]);
        assert_eq!(&buf[12..16], &[192, 168, 1, 10]);
        let back = Record::read_from(&mut &buf[..]).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn identity_ignores_counters() {
        let a = sample();
        let mut b = sample();
        b.in_bytes = 999;
        assert_eq!(a.cmp_identity(&b), Ordering::Equal);
        assert_ne!(a.cmp_full(&b), Ordering::Equal);

        let mut c = sample();
        c.dst_port = 80;
        assert_ne!(a.cmp_identity(&c), Ordering::Equal);
    }

    #[test]
    fn merge_adds_counters() {
        let mut a = sample();
        let b = sample();
        a.merge(&b);
        assert_eq!(a.count, 2);
        assert_eq!(a.out_bytes, 256);
        assert_eq!(a.in_bytes, 8192);
    }

    #[test]
    fn group_and_sort_projections() {
        let mut a = sample();
        let mut b = sample();
        b.proto = 17;
        b.dst_port = 53;

        // same host, different layer7
        assert_eq!(
            compare_group(&a, &b, &[Field::Host]),
            Ordering::Equal
        );
        assert_ne!(
            compare_group(&a, &b, &[Field::Host, Field::Layer7]),
            Ordering::Equal
        );

        a.in_bytes = 10;
        b.in_bytes = 20;
        let sort = [SortKey {
            field: Field::RxBytes,
            descending: true,
        }];
        assert_eq!(compare_sort(&b, &a, &sort), Ordering::Less);
    }
}
