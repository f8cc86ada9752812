//! Reporting client: receives a database dump over the control socket,
//! re-aggregates it under the requested group projection and renders it
//! as a table, JSON or delimited text.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::net::UnixStream;

use byteorder::{ByteOrder, NativeEndian};
use serde_json::{json, Value};

use crate::cli::{ReportArgs, SocketArgs};
use crate::database::{Database, Header};
use crate::error::{Error, Result};
use crate::protocol::Protocols;
use crate::record::{compare_group, compare_sort, Field, Record, COLUMNS};

pub enum Output {
    Show,
    Json,
    Csv,
}

pub fn report_main(mode: Output, args: ReportArgs) -> i32 {
    let protocols = match Protocols::load(&args.protocols) {
        Ok(protocols) => protocols,
        Err(e) => {
            eprintln!(
                "Unable to read protocol list {}: {}",
                args.protocols.display(),
                e
            );
            return 1;
        }
    };

    match run_report(mode, &args, &protocols) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error while processing command: {e}");
            1
        }
    }
}

pub fn list_main(args: &SocketArgs) -> i32 {
    match run_list(args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error while processing command: {e}");
            1
        }
    }
}

pub fn commit_main(args: &SocketArgs) -> i32 {
    match run_commit(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error while processing command: {e}");
            1
        }
    }
}

fn run_report(mode: Output, args: &ReportArgs, protocols: &Protocols) -> Result<()> {
    let db = recv_database(args)?;

    match mode {
        Output::Show => print!("{}", render_table(&db, args, protocols)),
        Output::Json => println!("{}", render_json(&db, args, protocols)),
        Output::Csv => print!("{}", render_csv(&db, args, protocols)),
    }
    Ok(())
}

/// Fetch the requested dump and re-aggregate it: insert under the group
/// comparator (merging colliding keys), then re-sort for presentation.
fn recv_database(args: &ReportArgs) -> Result<Database> {
    let mut stream = UnixStream::connect(&args.socket.socket)?;
    let request = format!("dump {}", args.timestamp.unwrap_or(0));
    stream.write_all(request.as_bytes())?;

    let mut hdr_buf = [0u8; crate::database::HEADER_SIZE];
    stream.read_exact(&mut hdr_buf)?;
    let hdr = Header::read_from(&mut &hdr_buf[..])?;

    let group = args.group_by.0.clone();
    let mut db = Database::mem(Box::new(move |a, b| compare_group(a, b, &group)));

    let mut buf = [0u8; crate::record::RECORD_SIZE];
    for _ in 0..hdr.entries {
        stream.read_exact(&mut buf)?;
        db.insert(&Record::read_from(&mut &buf[..])?)?;
    }

    let sort = args.order_by.0.clone();
    db.reorder(Box::new(move |a, b| compare_sort(a, b, &sort)));
    Ok(db)
}

fn run_list(args: &SocketArgs) -> Result<()> {
    let mut stream = UnixStream::connect(&args.socket)?;
    stream.write_all(b"list")?;

    let mut word = [0u8; 4];
    loop {
        match stream.read_exact(&mut word) {
            Ok(()) => {
                let stamp = NativeEndian::read_u32(&word);
                println!(
                    "{:04}-{:02}-{:02}",
                    stamp / 10000,
                    stamp % 10000 / 100,
                    stamp % 100
                );
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Returns the server-reported errno, negated; the process exit status
/// truncates it to a byte the same way a negative C exit code wraps.
fn run_commit(args: &SocketArgs) -> Result<i32> {
    let mut stream = UnixStream::connect(&args.socket)?;
    stream.write_all(b"commit")?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    if reply.is_empty() {
        return Err(Error::Invalid("empty commit reply"));
    }

    println!("{reply}");

    reply
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| -code)
        .ok_or(Error::Invalid("malformed commit reply"))
}

/// Presentation slot of a field; mirrors the output column order.
fn slot(field: Field) -> usize {
    match field {
        Field::Family => 0,
        Field::Proto => 1,
        Field::Port => 2,
        Field::Mac => 3,
        Field::Ip => 4,
        Field::Conns => 5,
        Field::RxBytes => 6,
        Field::RxPkts => 7,
        Field::TxBytes => 8,
        Field::TxPkts => 9,
        Field::Host => 10,
        Field::Layer7 => 11,
    }
}

/// Columns for the expanded (json/csv) renderings: the group projection
/// with host split into mac+ip and layer7 into proto+port, the five
/// counters, and a trailing layer7 name column when grouped by layer7.
fn output_columns(group: &[Field]) -> Vec<Field> {
    let mut flags = [false; 10];
    let mut layer7 = false;

    for field in group {
        match field {
            Field::Host => {
                flags[slot(Field::Mac)] = true;
                flags[slot(Field::Ip)] = true;
            }
            Field::Layer7 => {
                flags[slot(Field::Proto)] = true;
                flags[slot(Field::Port)] = true;
                layer7 = true;
            }
            field => flags[slot(*field)] = true,
        }
    }

    for counter in [
        Field::Conns,
        Field::RxBytes,
        Field::RxPkts,
        Field::TxBytes,
        Field::TxPkts,
    ] {
        flags[slot(counter)] = true;
    }

    let mut columns: Vec<Field> = COLUMNS
        .iter()
        .copied()
        .filter(|f| flags[slot(*f)])
        .collect();
    if layer7 {
        columns.push(Field::Layer7);
    }
    columns
}

/// 1024-based scaling with two decimals, as wide as the table columns
/// expect; exact counts with `plain`.
fn format_num(n: u64, plain: bool) -> String {
    if !plain {
        let mut e: u64 = 0x1000000000000000;
        for unit in ["E", "P", "T", "G", "M", "K"] {
            if n > e {
                let frac = (n % e) as u128 * 100 / e as u128;
                return format!("{:4}.{:02} {}", n / e, frac, unit);
            }
            e /= 1024;
        }
    }
    format!("{n:8} ")
}

fn format_proto(proto: u8) -> String {
    match proto {
        0 => "unspec.".to_owned(),
        1 => "ICMP".to_owned(),
        2 => "IGMP".to_owned(),
        6 => "TCP".to_owned(),
        17 => "UDP".to_owned(),
        41 => "IPV6".to_owned(),
        47 => "GRE".to_owned(),
        50 => "ESP".to_owned(),
        51 => "AH".to_owned(),
        58 => "IPV6-ICMP".to_owned(),
        132 => "SCTP".to_owned(),
        136 => "UDPLITE".to_owned(),
        other => other.to_string(),
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

fn format_ip(rec: &Record) -> String {
    let a = &rec.src_addr;
    if rec.is_ipv4() {
        Ipv4Addr::new(a[0], a[1], a[2], a[3]).to_string()
    } else {
        Ipv6Addr::from(*a).to_string()
    }
}

fn render_table(db: &Database, args: &ReportArgs, protocols: &Protocols) -> String {
    let mut marks = [None::<char>; 12];
    for field in &args.group_by.0 {
        marks[slot(*field)] = Some(' ');
    }
    for counter in 5..10 {
        marks[counter] = Some(' ');
    }
    for key in &args.order_by.0 {
        marks[slot(key.field)] = Some(if key.descending { '>' } else { '<' });
    }

    let m = |i: usize| marks[i].unwrap_or(' ');
    let mut out = String::new();

    if marks[slot(Field::Family)].is_some() {
        out += &format!("{} Fam ", m(0));
    }
    if marks[slot(Field::Host)].is_some() {
        out += &format!("         {} Host (    MAC )  ", m(10));
    } else {
        if marks[slot(Field::Mac)].is_some() {
            out += &format!("            {} MAC  ", m(3));
        }
        if marks[slot(Field::Ip)].is_some() {
            out += &format!("           {} IP  ", m(4));
        }
    }
    if marks[slot(Field::Layer7)].is_some() {
        out += &format!("  {} Layer7  ", m(11));
    } else {
        if marks[slot(Field::Proto)].is_some() {
            out += &format!("   {} Proto  ", m(1));
        }
        if marks[slot(Field::Port)].is_some() {
            out += &format!("{} Port ", m(2));
        }
    }
    out += &format!(
        "  {} Conn.   {} Downld. ( {} Pkts. )    {} Upload ( {} Pkts. )\n",
        m(5),
        m(6),
        m(7),
        m(8),
        m(9)
    );

    let plain = args.plain_numbers;
    for rec in db.records() {
        if marks[slot(Field::Family)].is_some() {
            out += &format!("IPv{}  ", if rec.is_ipv4() { 4 } else { 6 });
        }
        if marks[slot(Field::Host)].is_some() {
            out += &format!(
                "{:>15} ({:02x}:{:02x}:{:02x})  ",
                format_ip(rec),
                rec.src_mac[3],
                rec.src_mac[4],
                rec.src_mac[5]
            );
        } else {
            if marks[slot(Field::Mac)].is_some() {
                out += &format!("{:>17}  ", format_mac(&rec.src_mac));
            }
            if marks[slot(Field::Ip)].is_some() {
                out += &format!("{:>15}  ", format_ip(rec));
            }
        }
        if marks[slot(Field::Layer7)].is_some() {
            let name = protocols.lookup(rec.proto, rec.dst_port).unwrap_or("other");
            out += &format!("{name:>10}  ");
        } else {
            if marks[slot(Field::Proto)].is_some() {
                out += &format!("{:>10}  ", format_proto(rec.proto));
            }
            if marks[slot(Field::Port)].is_some() {
                out += &format!("{:>5}  ", rec.dst_port);
            }
        }
        out += &format!(
            "{}  {}B ({})  {}B ({})\n",
            format_num(rec.count, plain),
            format_num(rec.in_bytes, plain),
            format_num(rec.in_pkts, plain),
            format_num(rec.out_bytes, plain),
            format_num(rec.out_pkts, plain)
        );
    }

    out
}

fn json_cell(field: Field, rec: &Record, protocols: &Protocols) -> Value {
    match field {
        Field::Family => json!(if rec.is_ipv4() { 4 } else { 6 }),
        Field::Proto => json!(format_proto(rec.proto)),
        Field::Port => json!(rec.dst_port),
        Field::Mac => json!(format_mac(&rec.src_mac)),
        Field::Ip => json!(format_ip(rec)),
        Field::Conns => json!(rec.count),
        Field::RxBytes => json!(rec.in_bytes),
        Field::RxPkts => json!(rec.in_pkts),
        Field::TxBytes => json!(rec.out_bytes),
        Field::TxPkts => json!(rec.out_pkts),
        Field::Layer7 => match protocols.lookup(rec.proto, rec.dst_port) {
            Some(name) => json!(name),
            None => Value::Null,
        },
        Field::Host => Value::Null,
    }
}

fn render_json(db: &Database, args: &ReportArgs, protocols: &Protocols) -> Value {
    let columns = output_columns(&args.group_by.0);

    let data: Vec<Value> = db
        .records()
        .map(|rec| {
            Value::Array(
                columns
                    .iter()
                    .map(|field| json_cell(*field, rec, protocols))
                    .collect(),
            )
        })
        .collect();

    json!({
        "columns": columns.iter().map(|f| f.name()).collect::<Vec<_>>(),
        "data": data,
    })
}

fn csv_str(s: &str, quote: char, escape: char) -> String {
    let mut out = String::new();
    out.push(quote);
    for c in s.chars() {
        if c == escape {
            out.push(escape);
        }
        out.push(c);
    }
    out.push(quote);
    out
}

fn csv_cell(field: Field, rec: &Record, args: &ReportArgs, protocols: &Protocols) -> String {
    let (quote, escape) = (args.quote, args.escape);
    match field {
        Field::Family => if rec.is_ipv4() { "4" } else { "6" }.to_owned(),
        Field::Proto => csv_str(&format_proto(rec.proto), quote, escape),
        Field::Port => rec.dst_port.to_string(),
        Field::Mac => csv_str(&format_mac(&rec.src_mac), quote, escape),
        Field::Ip => csv_str(&format_ip(rec), quote, escape),
        Field::Conns => rec.count.to_string(),
        Field::RxBytes => rec.in_bytes.to_string(),
        Field::RxPkts => rec.in_pkts.to_string(),
        Field::TxBytes => rec.out_bytes.to_string(),
        Field::TxPkts => rec.out_pkts.to_string(),
        Field::Layer7 => match protocols.lookup(rec.proto, rec.dst_port) {
            Some(name) => csv_str(name, quote, escape),
            None => String::new(),
        },
        Field::Host => String::new(),
    }
}

fn render_csv(db: &Database, args: &ReportArgs, protocols: &Protocols) -> String {
    let columns = output_columns(&args.group_by.0);
    let mut out = String::new();

    for (i, field) in columns.iter().enumerate() {
        if i > 0 {
            out.push(args.separator);
        }
        out += &csv_str(field.name(), args.quote, args.escape);
    }
    out.push('\n');

    for rec in db.records() {
        for (i, field) in columns.iter().enumerate() {
            if i > 0 {
                out.push(args.separator);
            }
            out += &csv_cell(*field, rec, args, protocols);
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli_utils::{parse_group_projection, parse_sort_projection};
    use std::io::Cursor;

    fn rec(host: u8, port: u16, rx_bytes: u64, rx_pkts: u64) -> Record {
        Record {
            family: libc::AF_INET as u8,
            proto: 6,
            dst_port: port,
            src_mac: [2, 0, 0, 0, 0, host],
            src_addr: {
                let mut a = [0u8; 16];
                a[..4].copy_from_slice(&[192, 168, 1, host]);
                a
            },
            count: 1,
            out_pkts: 1,
            out_bytes: 10,
            in_pkts: rx_pkts,
            in_bytes: rx_bytes,
        }
    }

    fn aggregate(records: &[Record], group: &str, order: &str) -> Database {
        let group = parse_group_projection(group).unwrap().0;
        let mut db = Database::mem(Box::new(move |a, b| compare_group(a, b, &group)));
        for r in records {
            db.insert(r).unwrap();
        }
        let sort = parse_sort_projection(order).unwrap().0;
        db.reorder(Box::new(move |a, b| compare_sort(a, b, &sort)));
        db
    }

    #[test]
    fn group_by_host_sort_by_rx() {
        // host A: web 10B/1p + dns 2B/2p, host B: web 7B/1p
        let db = aggregate(
            &[rec(10, 443, 10, 1), rec(10, 53, 2, 2), rec(11, 443, 7, 1)],
            "host",
            "-rx_bytes",
        );

        let rows: Vec<Record> = db.records().copied().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].src_addr[3], 10);
        assert_eq!(rows[0].in_bytes, 12);
        assert_eq!(rows[0].in_pkts, 3);
        assert_eq!(rows[1].src_addr[3], 11);
        assert_eq!(rows[1].in_bytes, 7);
        assert_eq!(rows[1].in_pkts, 1);
    }

    #[test]
    fn column_expansion() {
        let group = parse_group_projection("family,host,layer7").unwrap().0;
        let columns = output_columns(&group);
        assert_eq!(
            columns,
            [
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
                Field::Layer7,
            ]
        );

        let group = parse_group_projection("ip").unwrap().0;
        let columns = output_columns(&group);
        assert_eq!(
            columns,
            [
                Field::Ip,
                Field::Conns,
                Field::RxBytes,
                Field::RxPkts,
                Field::TxBytes,
                Field::TxPkts,
            ]
        );
    }

    #[test]
    fn number_scaling() {
        assert_eq!(format_num(123, true), "     123 ");
        assert_eq!(format_num(2048, false), "   2.00 K");
        assert_eq!(format_num(1024, false), "    1024 ");
        assert_eq!(format_num(3 * 1024 * 1024 + 512 * 1024, false), "   3.50 M");
    }

    #[test]
    fn csv_escaping() {
        assert_eq!(csv_str("plain", '"', '"'), "\"plain\"");
        assert_eq!(csv_str("say \"hi\"", '"', '"'), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn json_shape() {
        let db = aggregate(&[rec(10, 443, 10, 1)], "family,host,layer7", "-rx_bytes");
        let protocols = Protocols::parse(Cursor::new("6 443 https\n")).unwrap();
        let args = test_args();

        let value = render_json(&db, &args, &protocols);
        let columns = value["columns"].as_array().unwrap();
        assert_eq!(columns.len(), 11);
        assert_eq!(columns[0], "family");
        assert_eq!(*columns.last().unwrap(), "layer7");

        let row = value["data"][0].as_array().unwrap();
        assert_eq!(row[0], 4);
        assert_eq!(row[4], "192.168.1.10");
        assert_eq!(row[10], "https");
    }

    fn test_args() -> ReportArgs {
        ReportArgs {
            socket: crate::cli::SocketArgs {
                socket: "/tmp/hostmeter.sock".into(),
            },
            timestamp: None,
            group_by: parse_group_projection("family,host,layer7").unwrap(),
            order_by: parse_sort_projection("-rx_bytes,-rx_pkts").unwrap(),
            plain_numbers: false,
            protocols: "/dev/null".into(),
            separator: '\t',
            quote: '"',
            escape: '"',
        }
    }
}
