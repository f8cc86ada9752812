use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, Local, TimeZone};

use crate::error::Error;

const DAY_SECS: i64 = 86400;

/// Accounting period specification.
///
/// `Monthly(d)` starts a period at midnight local time on day `d` of
/// each month; a negative `d` counts from the end of the month, clamped
/// to a valid day. `Fixed` starts periods at `base + k * days * 86400`
/// for integer `k`, with `base` aligned down to a multiple of 86400.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interval {
    Monthly(i32),
    Fixed { base: i64, days: i32 },
}

fn is_leapyear(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: i32, month: u32) -> i32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        2 => 28 + is_leapyear(year) as i32,
        _ => 30,
    }
}

fn step_month(year: &mut i32, month: &mut u32, forward: bool) {
    if forward {
        if *month < 12 {
            *month += 1;
        } else {
            *month = 1;
            *year += 1;
        }
    } else if *month > 1 {
        *month -= 1;
    } else {
        *month = 12;
        *year -= 1;
    }
}

fn stamp(year: i32, month: u32, day: i32) -> u32 {
    (year as u32) * 10000 + month * 100 + day as u32
}

impl Interval {
    /// Canonical period stamp (yyyymmdd) for the period `offset` whole
    /// periods away from the one containing `now`.
    pub fn timestamp_at(&self, now: DateTime<Local>, offset: i32) -> u32 {
        match *self {
            Interval::Monthly(date) => {
                let mut year = now.year();
                let mut month = now.month();
                let day = now.day() as i32;
                let mut offset = offset;

                while offset != 0 {
                    if offset < 0 {
                        step_month(&mut year, &mut month, false);
                        offset += 1;
                    } else {
                        step_month(&mut year, &mut month, true);
                        offset -= 1;
                    }
                }

                let mut date = date;
                let mut monthdays = days_in_month(year, month);

                if date > 0 {
                    if day < date {
                        step_month(&mut year, &mut month, false);
                    }
                } else {
                    if day < date + monthdays {
                        step_month(&mut year, &mut month, false);
                    }

                    monthdays = days_in_month(year, month);
                    date = (date + monthdays).clamp(1, monthdays);
                }

                stamp(year, month, date)
            }
            Interval::Fixed { base, days } => {
                let stride = days as i64 * DAY_SECS;
                let mut secs = now.timestamp();
                secs -= secs.rem_euclid(DAY_SECS);
                secs += offset as i64 * stride;
                secs -= (secs - base).rem_euclid(stride);

                let start = Local
                    .timestamp_opt(secs, 0)
                    .earliest()
                    .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap());
                stamp(start.year(), start.month(), start.day() as i32)
            }
        }
    }

    pub fn timestamp(&self, offset: i32) -> u32 {
        self.timestamp_at(Local::now(), offset)
    }

    fn type_byte(&self) -> u8 {
        match self {
            Interval::Monthly(_) => 1,
            Interval::Fixed { .. } => 2,
        }
    }

    /// 13-byte wire form: type, BE i32 value, BE i64 base. A zero type
    /// byte encodes "no interval" and is rejected by loads.
    pub fn write_opt_to<W: Write>(intv: Option<&Interval>, w: &mut W) -> io::Result<()> {
        match intv {
            None => {
                w.write_u8(0)?;
                w.write_i32::<BigEndian>(0)?;
                w.write_i64::<BigEndian>(0)?;
            }
            Some(intv) => {
                w.write_u8(intv.type_byte())?;
                match *intv {
                    Interval::Monthly(value) => {
                        w.write_i32::<BigEndian>(value)?;
                        w.write_i64::<BigEndian>(0)?;
                    }
                    Interval::Fixed { base, days } => {
                        w.write_i32::<BigEndian>(days)?;
                        w.write_i64::<BigEndian>(base)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn read_opt_from<R: Read>(r: &mut R) -> io::Result<Option<Interval>> {
        let kind = r.read_u8()?;
        let value = r.read_i32::<BigEndian>()?;
        let base = r.read_i64::<BigEndian>()?;
        Ok(match kind {
            1 => Some(Interval::Monthly(value)),
            2 => Some(Interval::Fixed { base, days: value }),
            _ => None,
        })
    }
}

impl FromStr for Interval {
    type Err = Error;

    /// `N` selects a monthly interval by day-of-month; `YYYY-MM-DD/N`
    /// selects a fixed stride of `N` days anchored at the given day.
    fn from_str(spec: &str) -> Result<Interval, Error> {
        if let Some((date, value)) = spec.split_once('/') {
            let mut it = date.split('-');
            let (year, month, mday) = match (it.next(), it.next(), it.next(), it.next()) {
                (Some(y), Some(m), Some(d), None) => (
                    y.parse::<i32>().map_err(|_| Error::Invalid("interval date"))?,
                    m.parse::<u32>().map_err(|_| Error::Invalid("interval date"))?,
                    d.parse::<i32>().map_err(|_| Error::Invalid("interval date"))?,
                ),
                _ => return Err(Error::Invalid("interval date")),
            };

            if !(2000..=3000).contains(&year)
                || !(1..=12).contains(&month)
                || mday < 1
                || mday > days_in_month(year, month)
            {
                return Err(Error::Invalid("interval date out of range"));
            }

            let days: i32 = value.parse().map_err(|_| Error::Invalid("interval stride"))?;
            if days <= 0 {
                return Err(Error::Invalid("interval stride must be positive"));
            }

            let base = Local
                .with_ymd_and_hms(year, month, mday as u32, 0, 0, 0)
                .earliest()
                .ok_or(Error::Invalid("interval date"))?
                .timestamp();

            Ok(Interval::Fixed {
                base: base - base.rem_euclid(DAY_SECS),
                days,
            })
        } else {
            let date: i32 = spec.parse().map_err(|_| Error::Invalid("interval"))?;
            if date == 0 || !(-31..=31).contains(&date) {
                return Err(Error::Invalid("day of month out of range"));
            }
            Ok(Interval::Monthly(date))
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Interval::Monthly(date) => write!(f, "{date}"),
            Interval::Fixed { base, days } => {
                let start = Local
                    .timestamp_opt(base, 0)
                    .earliest()
                    .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap());
                write!(
                    f,
                    "{:04}-{:02}-{:02}/{}",
                    start.year(),
                    start.month(),
                    start.day(),
                    days
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(year, month, day, hour, 0, 0)
            .earliest()
            .unwrap()
    }

    #[test]
    fn monthly_by_first() {
        let intv = Interval::Monthly(1);
        assert_eq!(intv.timestamp_at(local(2025, 1, 15, 12), 0), 20250101);
        assert_eq!(intv.timestamp_at(local(2025, 2, 1, 0), 0), 20250201);
        // one period back
        assert_eq!(intv.timestamp_at(local(2025, 2, 1, 0), -1), 20250101);
        assert_eq!(intv.timestamp_at(local(2025, 1, 10, 0), -1), 20241201);
    }

    #[test]
    fn monthly_mid_month_boundary() {
        let intv = Interval::Monthly(15);
        // before the boundary the period started in the previous month
        assert_eq!(intv.timestamp_at(local(2025, 3, 14, 23), 0), 20250215);
        assert_eq!(intv.timestamp_at(local(2025, 3, 15, 0), 0), 20250315);
    }

    #[test]
    fn monthly_from_month_end() {
        let intv = Interval::Monthly(-1);
        // 31-day month: boundary on the 30th
        assert_eq!(intv.timestamp_at(local(2025, 1, 31, 0), 0), 20250130);
        // before the boundary: previous month, recomputed for its length
        assert_eq!(intv.timestamp_at(local(2025, 3, 1, 0), 0), 20250227);
    }

    #[test]
    fn fixed_stride() {
        let base = local(2025, 1, 1, 0).timestamp();
        let base = base - base.rem_euclid(DAY_SECS);
        let intv = Interval::Fixed { base, days: 7 };

        let inside = intv.timestamp_at(local(2025, 1, 5, 10), 0);
        let at_start = intv.timestamp_at(local(2025, 1, 1, 0), 0);
        assert_eq!(inside, at_start);

        let next = intv.timestamp_at(local(2025, 1, 8, 1), 0);
        assert!(next > inside);
        assert_eq!(intv.timestamp_at(local(2025, 1, 8, 1), -1), inside);
    }

    #[test]
    fn parse_specs() {
        assert_eq!("1".parse::<Interval>().unwrap(), Interval::Monthly(1));
        assert_eq!("-3".parse::<Interval>().unwrap(), Interval::Monthly(-3));
        assert!("0".parse::<Interval>().is_err());
        assert!("32".parse::<Interval>().is_err());
        assert!("x".parse::<Interval>().is_err());

        match "2025-01-01/7".parse::<Interval>().unwrap() {
            Interval::Fixed { base, days } => {
                assert_eq!(days, 7);
                assert_eq!(base % DAY_SECS, 0);
            }
            other => panic!("unexpected interval {other:?}"),
        }
        assert!("2025-13-01/7".parse::<Interval>().is_err());
        assert!("2025-01-01/0".parse::<Interval>().is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let mut buf = Vec::new();
        let intv = Interval::Fixed {
            base: 1735689600,
            days: 7,
        };
        Interval::write_opt_to(Some(&intv), &mut buf).unwrap();
        assert_eq!(buf.len(), 13);
        assert_eq!(
            Interval::read_opt_from(&mut &buf[..]).unwrap(),
            Some(intv)
        );

        buf.clear();
        Interval::write_opt_to(None, &mut buf).unwrap();
        assert_eq!(Interval::read_opt_from(&mut &buf[..]).unwrap(), None);
    }
}
