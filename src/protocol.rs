use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};

/// The (protocol, destination port) → application-name catalog used for
/// layer7 aggregation. Traffic whose pair has no entry is clobbered to
/// (0, 0) by the ingest pipeline so it aggregates as "other".
pub struct Protocols {
    map: HashMap<(u8, u16), u16>,
    names: Vec<String>,
}

impl Protocols {
    pub fn empty() -> Protocols {
        Protocols {
            map: HashMap::new(),
            names: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Protocols> {
        let file = File::open(path)?;
        Protocols::parse(BufReader::new(file))
    }

    /// One entry per line: protocol number, port, name, whitespace
    /// separated. Consecutive lines with the same name share an index.
    pub fn parse<R: BufRead>(input: R) -> Result<Protocols> {
        let mut catalog = Protocols::empty();

        for line in input.lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (proto, port, name) = match (fields.next(), fields.next(), fields.next()) {
                (Some(proto), Some(port), Some(name)) => (proto, port, name),
                _ => continue,
            };

            let proto: u8 = match proto.parse() {
                Ok(n) => n,
                Err(_) => return Err(Error::Invalid("protocol number")),
            };
            let port: u16 = match port.parse() {
                Ok(n) => n,
                Err(_) => return Err(Error::Invalid("protocol port")),
            };

            if catalog.names.last().map(|s| s.as_str()) != Some(name) {
                catalog.names.push(name.to_owned());
            }

            let idx = (catalog.names.len() - 1) as u16;
            catalog.map.insert((proto, port), idx);
        }

        Ok(catalog)
    }

    pub fn lookup(&self, proto: u8, port: u16) -> Option<&str> {
        self.map
            .get(&(proto, port))
            .map(|&idx| self.names[idx as usize].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn lookup_and_shared_index() {
        let catalog = Protocols::parse(Cursor::new(
            "6 80 http\n6 443 https\n17 443 https\n17 53 dns\n6 53 dns\n",
        ))
        .unwrap();

        assert_eq!(catalog.lookup(6, 80), Some("http"));
        assert_eq!(catalog.lookup(6, 443), Some("https"));
        assert_eq!(catalog.lookup(17, 443), Some("https"));
        assert_eq!(catalog.lookup(17, 53), Some("dns"));
        assert_eq!(catalog.lookup(17, 9999), None);
        // https and dns each span two consecutive lines
        assert_eq!(catalog.names.len(), 3);
        assert_eq!(catalog.map.len(), 5);
    }

    #[test]
    fn skips_short_lines() {
        let catalog = Protocols::parse(Cursor::new("6 80 http\n\nbogus\n17 53 dns\n")).unwrap();
        assert_eq!(catalog.map.len(), 2);
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(Protocols::parse(Cursor::new("tcp 80 http\n")).is_err());
        assert!(Protocols::parse(Cursor::new("6 http http\n")).is_err());
    }
}
