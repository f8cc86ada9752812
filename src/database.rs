use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::timing::Interval;

/// "nlbm"
pub const MAGIC: u32 = 0x6e6c_626d;

/// Magic + entries + timestamp + interval descriptor.
pub const HEADER_SIZE: usize = 25;

const INITIAL_CAPACITY: usize = 100;

/// Ordering used by a store's index. The comparator must be a total
/// order over record identities for the primary (accounting) store; the
/// reporting side closes over a group or sort projection instead.
pub type Comparator = Box<dyn Fn(&Record, &Record) -> Ordering>;

/// Database header as it appears on disk and on the control socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub entries: u32,
    pub timestamp: u32,
    pub interval: Option<Interval>,
}

impl Header {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(MAGIC)?;
        w.write_u32::<BigEndian>(self.entries)?;
        w.write_u32::<BigEndian>(self.timestamp)?;
        Interval::write_opt_to(self.interval.as_ref(), w)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Header> {
        if r.read_u32::<BigEndian>()? != MAGIC {
            return Err(Error::Invalid("bad database magic"));
        }
        let entries = r.read_u32::<BigEndian>()?;
        let timestamp = r.read_u32::<BigEndian>()?;
        let interval = Interval::read_opt_from(r)?;
        Ok(Header {
            entries,
            timestamp,
            interval,
        })
    }

    fn check(&self, timestamp: u32) -> Result<()> {
        if self.interval.is_none() {
            return Err(Error::Invalid("missing interval descriptor"));
        }
        if self.timestamp != timestamp {
            return Err(Error::Invalid("database timestamp mismatch"));
        }
        Ok(())
    }
}

/// The aggregation store: a growable array of fixed-width records plus
/// an ordered index of record slots.
///
/// Slots are stable for the lifetime of a record, so the index survives
/// buffer growth; it is rebuilt only by `reorder` and `reset`.
pub struct Database {
    interval: Option<Interval>,
    timestamp: u32,
    limit: u32,
    /// Insert cursor; selects the eviction slot once the hard limit is
    /// reached.
    off: u64,
    pristine: bool,
    capacity: usize,
    records: Vec<Record>,
    index: Vec<u32>,
    cmp: Comparator,
}

fn db_file(dir: &Path, timestamp: u32, compress: bool) -> PathBuf {
    dir.join(format!(
        "{}.db{}",
        timestamp,
        if compress { ".gz" } else { "" }
    ))
}

impl Database {
    fn alloc(cmp: Comparator, interval: Option<Interval>, prealloc: bool, limit: u32) -> Database {
        let mut capacity = INITIAL_CAPACITY;
        if prealloc && limit > 0 {
            capacity = limit as usize;
        } else if limit > 0 && (limit as usize) < capacity {
            capacity = limit as usize;
        }

        Database {
            interval,
            timestamp: 0,
            limit,
            off: 0,
            pristine: true,
            capacity,
            records: Vec::with_capacity(capacity),
            index: Vec::with_capacity(capacity),
            cmp,
        }
    }

    /// Store for live accounting, ordered by record identity.
    pub fn period(interval: Interval, timestamp: u32, prealloc: bool, limit: u32) -> Database {
        let mut db = Database::alloc(
            Box::new(|a, b| a.cmp_identity(b)),
            Some(interval),
            prealloc && limit > 0,
            limit,
        );
        db.timestamp = timestamp;
        db
    }

    /// Unbounded store for the reporting-side re-aggregation, ordered
    /// (and deduplicated) by `cmp`.
    pub fn mem(cmp: Comparator) -> Database {
        Database::alloc(cmp, None, false, 0)
    }

    pub fn entries(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn interval(&self) -> Option<Interval> {
        self.interval
    }

    pub fn is_pristine(&self) -> bool {
        self.pristine
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn header(&self) -> Header {
        Header {
            entries: self.entries(),
            timestamp: self.timestamp,
            interval: self.interval,
        }
    }

    fn find(&self, rec: &Record) -> std::result::Result<usize, usize> {
        self.index
            .binary_search_by(|&slot| (self.cmp)(&self.records[slot as usize], rec))
    }

    fn grow(&mut self) -> Result<()> {
        let mut capacity = self.capacity + self.capacity / 2;

        if self.limit > 0 && capacity > self.limit as usize {
            capacity = self.limit as usize;
        }
        if capacity <= self.capacity {
            return Err(Error::NoSpace);
        }

        self.records.reserve_exact(capacity - self.records.len());
        self.capacity = capacity;
        Ok(())
    }

    /// Merge `rec` into an entry with the same key, or append a copy.
    /// At the hard limit the oldest insertion slot is overwritten.
    pub fn insert(&mut self, rec: &Record) -> Result<()> {
        let pos = match self.find(rec) {
            Ok(pos) => {
                let slot = self.index[pos] as usize;
                self.records[slot].merge(rec);
                return Ok(());
            }
            Err(pos) => pos,
        };

        if self.records.len() >= self.capacity {
            match self.grow() {
                Ok(()) => {}
                Err(Error::NoSpace) => {
                    // hard limit reached, start overwriting old entries
                    let slot = (self.off % self.capacity as u64) as usize;
                    self.off += 1;

                    let old = self.records[slot];
                    let old_pos = self
                        .find(&old)
                        .expect("evicted record missing from index");
                    self.index.remove(old_pos);

                    self.records[slot] = *rec;
                    let pos = self.find(rec).unwrap_err();
                    self.index.insert(pos, slot as u32);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        self.records.push(*rec);
        self.off += 1;
        self.index.insert(pos, (self.records.len() - 1) as u32);
        Ok(())
    }

    /// Merge-only variant: fails with `NotFound` when no entry matches,
    /// so counter refreshes never create flows the store hasn't seen.
    pub fn update(&mut self, rec: &Record) -> Result<()> {
        match self.find(rec) {
            Ok(pos) => {
                let slot = self.index[pos] as usize;
                self.records[slot].merge(rec);
                Ok(())
            }
            Err(_) => Err(Error::NotFound),
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        self.index.extend(0..self.records.len() as u32);
        let records = &self.records;
        let cmp = &self.cmp;
        self.index
            .sort_by(|&a, &b| cmp(&records[a as usize], &records[b as usize]));
    }

    /// Switch the index to a different comparator and rebuild. Record
    /// locations are unchanged.
    pub fn reorder(&mut self, cmp: Comparator) {
        self.cmp = cmp;
        self.rebuild_index();
    }

    /// Records in index order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.index
            .iter()
            .map(move |&slot| &self.records[slot as usize])
    }

    /// Clear in place for a new period; the buffer keeps its capacity.
    pub fn reset(&mut self, timestamp: u32) {
        self.records.clear();
        self.index.clear();
        self.off = 0;
        self.timestamp = timestamp;
    }

    fn write_contents<W: Write>(&self, w: &mut W, timestamp: u32) -> Result<()> {
        Header {
            entries: self.entries(),
            timestamp,
            interval: self.interval,
        }
        .write_to(w)?;

        for rec in &self.records {
            rec.write_to(w)?;
        }
        Ok(())
    }

    /// Serialise to `<dir>/<timestamp>.db[.gz]`.
    ///
    /// A pristine store refuses to clobber an existing file: storage
    /// that appeared after startup carries data the caller must `load`
    /// (merging) before retrying.
    pub fn save(&mut self, dir: &Path, timestamp: u32, compress: bool) -> Result<()> {
        let file = db_file(dir, timestamp, compress);

        if self.pristine && timestamp > 0 && file.exists() {
            return Err(Error::Exists);
        }

        let res = if compress {
            File::create(&file).map_err(Error::from).and_then(|f| {
                let mut gz = GzEncoder::new(f, Compression::best());
                self.write_contents(&mut gz, timestamp)?;
                gz.finish()?;
                Ok(())
            })
        } else {
            File::create(&file).map_err(Error::from).and_then(|f| {
                let mut w = BufWriter::new(f);
                self.write_contents(&mut w, timestamp)?;
                w.flush()?;
                Ok(())
            })
        };

        if let Err(e) = res {
            let _ = fs::remove_file(&file);
            return Err(e);
        }

        if timestamp > 0 {
            self.pristine = false;
        }
        Ok(())
    }

    fn restore_stream<R: Read>(&mut self, mut r: R, timestamp: u32) -> Result<()> {
        let hdr = Header::read_from(&mut r)?;
        hdr.check(timestamp)?;

        let mut entries = hdr.entries;
        if self.limit > 0 && self.limit < entries {
            entries = self.limit;
        }

        self.pristine = false;

        for _ in 0..entries {
            let rec = Record::read_from(&mut r).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::Invalid("truncated database"),
                _ => Error::from(e),
            })?;
            self.insert(&rec)?;
        }

        if entries == hdr.entries && r.read(&mut [0u8; 1])? != 0 {
            return Err(Error::Invalid("trailing data in database"));
        }
        Ok(())
    }

    /// Read `<dir>/<timestamp>.db.gz` or, failing that, the raw `.db`,
    /// and merge every stored record into this store.
    pub fn load(&mut self, dir: &Path, timestamp: u32) -> Result<()> {
        let gz = db_file(dir, timestamp, true);
        if gz.exists() {
            let file = File::open(&gz)?;
            return self.restore_stream(GzDecoder::new(file), timestamp);
        }

        let raw = db_file(dir, timestamp, false);
        if raw.exists() {
            let file = File::open(&raw)?;
            let map = unsafe { Mmap::map(&file)? };
            if map.len() < HEADER_SIZE {
                return Err(Error::Invalid("short database file"));
            }
            return self.restore_stream(&map[..], timestamp);
        }

        Err(Error::NotFound)
    }

    /// Existence / validity probe without a destination store.
    pub fn probe(dir: &Path, timestamp: u32) -> Result<()> {
        let gz = db_file(dir, timestamp, true);
        if gz.exists() {
            let file = File::open(&gz)?;
            let hdr = Header::read_from(&mut GzDecoder::new(file))?;
            return hdr.check(timestamp);
        }

        let raw = db_file(dir, timestamp, false);
        if raw.exists() {
            let file = File::open(&raw)?;
            let map = unsafe { Mmap::map(&file)? };
            if map.len() < HEADER_SIZE {
                return Err(Error::Invalid("short database file"));
            }
            let hdr = Header::read_from(&mut &map[..])?;
            return hdr.check(timestamp);
        }

        Err(Error::NotFound)
    }

    /// Close the current period if `next_timestamp` has moved past it:
    /// save under the old stamp, then reset in place. Returns true when
    /// the period rolled; the caller is expected to re-dump conntrack so
    /// still-open flows carry over into the new period.
    pub fn archive(&mut self, next_timestamp: u32, dir: &Path, compress: bool) -> Result<bool> {
        if next_timestamp <= self.timestamp {
            return Ok(false);
        }

        let current = self.timestamp;
        self.save(dir, current, compress)?;
        self.reset(next_timestamp);
        Ok(true)
    }
}

/// Delete archived databases older than `cutoff` (a yyyymmdd stamp).
/// Files that do not match the `<stamp>.db[.gz]` naming scheme are left
/// alone.
pub fn cleanup(dir: &Path, cutoff: u32) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".db.gz").or_else(|| name.strip_suffix(".db"))
        else {
            continue;
        };
        let Ok(num) = stem.parse::<u32>() else { continue };

        if num < 20000101 || num > cutoff {
            continue;
        }

        if let Err(e) = fs::remove_file(entry.path()) {
            log::warn!("unable to delete {}: {}", entry.path().display(), e);
        }
    }
    Ok(())
}
