use std::time::Duration;

use crate::record::{Field, SortKey};

/// Parses a time span: a bare integer is seconds, anything else goes
/// through the usual suffixed forms ("30s", "12h", "2d", "1w").
pub fn parse_timespan(arg: &str) -> Result<Duration, String> {
    if !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = arg.parse().map_err(|e| format!("{e}"))?;
        return Ok(Duration::from_secs(secs));
    }

    humantime::parse_duration(arg).map_err(|e| format!("{e}"))
}

/// Netlink receive buffer size; the kernel rejects tiny buffers, so
/// anything below 32 KiB is refused up front.
pub fn parse_bufsize(arg: &str) -> Result<usize, String> {
    let size: usize = arg.parse().map_err(|e| format!("{e}"))?;
    if size < 32768 {
        return Err("netlink buffer size must be at least 32768".into());
    }
    Ok(size)
}

/// `YYYY-MM-DD` to a yyyymmdd period stamp.
pub fn parse_date(arg: &str) -> Result<u32, String> {
    let mut it = arg.split('-');
    let (Some(year), Some(month), Some(day), None) = (it.next(), it.next(), it.next(), it.next())
    else {
        return Err(format!("unrecognized date '{arg}'"));
    };

    let year: u32 = year.parse().map_err(|_| format!("unrecognized date '{arg}'"))?;
    let month: u32 = month.parse().map_err(|_| format!("unrecognized date '{arg}'"))?;
    let day: u32 = day.parse().map_err(|_| format!("unrecognized date '{arg}'"))?;

    if !(1..=9999).contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(format!("unrecognized date '{arg}'"));
    }

    Ok(year * 10000 + month * 100 + day)
}

/// Group projection: comma-separated field names, no inversion.
#[derive(Clone, Debug)]
pub struct Projection(pub Vec<Field>);

pub fn parse_group_projection(arg: &str) -> Result<Projection, String> {
    let mut fields = Vec::new();
    for name in arg.split(',') {
        if let Some(stripped) = name.strip_prefix('-') {
            return Err(format!("cannot invert group column '{stripped}'"));
        }
        let field = Field::parse(name).ok_or_else(|| format!("unrecognized field '{name}'"))?;
        fields.push(field);
    }
    Ok(Projection(fields))
}

/// Sort projection: comma-separated field names, `-` prefix for
/// descending order.
#[derive(Clone, Debug)]
pub struct SortProjection(pub Vec<SortKey>);

pub fn parse_sort_projection(arg: &str) -> Result<SortProjection, String> {
    let mut keys = Vec::new();
    for name in arg.split(',') {
        let (name, descending) = match name.strip_prefix('-') {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        let field = Field::parse(name).ok_or_else(|| format!("unrecognized field '{name}'"))?;
        keys.push(SortKey { field, descending });
    }
    Ok(SortProjection(keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespans() {
        assert_eq!(parse_timespan("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_timespan("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_timespan("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_timespan("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_timespan("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_timespan("1w").unwrap(), Duration::from_secs(604800));
        assert!(parse_timespan("soon").is_err());
        assert!(parse_timespan("").is_err());
    }

    #[test]
    fn dates() {
        assert_eq!(parse_date("2025-01-31").unwrap(), 20250131);
        assert!(parse_date("2025-13-01").is_err());
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn projections() {
        let group = parse_group_projection("family,host,layer7").unwrap();
        assert_eq!(group.0, [Field::Family, Field::Host, Field::Layer7]);
        assert!(parse_group_projection("-host").is_err());
        assert!(parse_group_projection("bogus").is_err());

        let sort = parse_sort_projection("-rx_bytes,conns").unwrap();
        assert_eq!(sort.0[0].field, Field::RxBytes);
        assert!(sort.0[0].descending);
        assert!(!sort.0[1].descending);
    }

    #[test]
    fn bufsize_floor() {
        assert_eq!(parse_bufsize("524288").unwrap(), 524288);
        assert!(parse_bufsize("1024").is_err());
    }
}
