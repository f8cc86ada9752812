//! The accounting daemon: one single-threaded event loop owning the
//! live database, fed by the conntrack socket, paced by the refresh and
//! commit timers, and answering the control socket.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tokio::time::{interval_at, Instant};

use crate::cli::MonitorArgs;
use crate::conntrack::{self, Conntrack, Flow};
use crate::database::{self, Database};
use crate::error::{Error, Result};
use crate::neigh::Neighbors;
use crate::protocol::Protocols;
use crate::record::Record;
use crate::sock;
use crate::subnets::{self, Subnet};
use crate::timing::Interval;

const RECV_BUF: usize = 65536;
const DELAYED_INSERT: Duration = Duration::from_millis(500);

pub struct State {
    pub args: MonitorArgs,
    pub interval: Interval,
    pub db: RefCell<Database>,
    pub neighbors: RefCell<Neighbors>,
    pub protocols: Protocols,
    pub conntrack: Conntrack,
    pending_inserts: Cell<u32>,
}

#[tokio::main(flavor = "current_thread")]
pub async fn monitor_main(args: MonitorArgs) -> i32 {
    let local = LocalSet::new();
    local.run_until(run(args)).await
}

async fn run(args: MonitorArgs) -> i32 {
    let interval = match args.interval {
        Some(interval) => interval,
        None => {
            log::info!("no interval specified; assuming 1st of month");
            Interval::Monthly(1)
        }
    };

    if let Err(e) = fs::create_dir_all(&args.database_dir) {
        eprintln!(
            "Unable to create database directory {}: {}",
            args.database_dir.display(),
            e
        );
        return 1;
    }

    if args.generations > 0 {
        let cutoff = interval.timestamp(-(args.generations as i32));
        if let Err(e) = database::cleanup(&args.database_dir, cutoff) {
            log::warn!("database cleanup failed: {e}");
        }
    }

    let timestamp = interval.timestamp(0);
    log::info!("accounting interval {interval}, current period {timestamp}");
    let mut db = Database::period(interval, timestamp, args.prealloc, args.limit);

    // prefer the crash-recovery snapshot, fall back to the archive of
    // the current period
    let mut restored = db.load(&args.tempdir, 0);
    if matches!(&restored, Err(e) if e.is_not_found()) {
        restored = db.load(&args.database_dir, timestamp);
    }
    match restored {
        Ok(()) => log::info!("restored {} database entries", db.entries()),
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            eprintln!("Unable to restore database: {e}");
            return 1;
        }
    }

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

    let conntrack = match Conntrack::connect(args.netlink_buffer) {
        Ok(conntrack) => conntrack,
        Err(e) => {
            eprintln!("Unable to connect nfnetlink: {e}");
            return 1;
        }
    };

    let neighbors = match Neighbors::connect() {
        Ok(neighbors) => neighbors,
        Err(e) => {
            eprintln!("Unable to connect rtnetlink: {e}");
            return 1;
        }
    };

    let listener = match sock::bind(&args.socket) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Unable to create control socket: {e}");
            return 1;
        }
    };

    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigusr1)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::user_defined1()),
    ) else {
        eprintln!("Unable to install signal handlers");
        return 1;
    };

    let state = Rc::new(State {
        args,
        interval,
        db: RefCell::new(db),
        neighbors: RefCell::new(neighbors),
        protocols,
        conntrack,
        pending_inserts: Cell::new(0),
    });

    let mut refresh = interval_at(
        Instant::now() + state.args.refresh_interval,
        state.args.refresh_interval,
    );
    let mut commit = interval_at(
        Instant::now() + state.args.commit_interval,
        state.args.commit_interval,
    );
    let mut buf = vec![0u8; RECV_BUF];

    loop {
        tokio::select! {
            res = state.conntrack.recv(&mut buf) => match res {
                Ok(len) => handle_events(&state, &buf[..len]).await,
                Err(e) => log::warn!("netlink receive failure: {e}"),
            },
            _ = refresh.tick() => handle_refresh(&state).await,
            _ = commit.tick() => {
                let _ = save_persistent(&state);
            }
            res = listener.accept() => match res {
                Ok((stream, _)) => sock::serve_client(&state, stream).await,
                Err(e) => log::warn!("control socket accept failed: {e}"),
            },
            _ = sigint.recv() => return shutdown(&state, false),
            _ = sigterm.recv() => return shutdown(&state, true),
            _ = sigusr1.recv() => return shutdown(&state, false),
        }
    }
}

/// Map one conntrack flow onto an accounting record, or drop it.
///
/// Traffic between a remote peer and a local host is attributed to the
/// local side; local-to-local and remote-to-remote flows are not
/// accounted. A (proto, port) pair unknown to the catalog is clobbered
/// to (0, 0) so all such traffic aggregates into one bucket per host.
pub fn classify_flow(
    flow: &Flow,
    subnets: &[Subnet],
    protocols: &Protocols,
    allow_insert: bool,
) -> Option<Record> {
    let mut rec = Record {
        family: flow.family,
        count: allow_insert as u64,
        ..Record::default()
    };

    let orig_src_local = subnets::is_local(subnets, flow.family, &flow.orig.src);
    let orig_dst_local = subnets::is_local(subnets, flow.family, &flow.orig.dst);
    let reply_src_local = subnets::is_local(subnets, flow.family, &flow.reply.src);
    let reply_dst_local = subnets::is_local(subnets, flow.family, &flow.reply.dst);

    if !orig_src_local && orig_dst_local {
        // remote -> local: the reply source is the local host, even
        // behind NAT
        rec.proto = flow.reply.proto;
        rec.dst_port = flow.reply.src_port;
        rec.src_addr = flow.reply.src;
        rec.in_pkts = flow.orig_counters.pkts;
        rec.in_bytes = flow.orig_counters.bytes;
        rec.out_pkts = flow.reply_counters.pkts;
        rec.out_bytes = flow.reply_counters.bytes;
    } else if !reply_src_local && reply_dst_local {
        // local -> remote
        rec.proto = flow.orig.proto;
        rec.dst_port = flow.orig.dst_port;
        rec.src_addr = flow.orig.src;
        rec.out_pkts = flow.orig_counters.pkts;
        rec.out_bytes = flow.orig_counters.bytes;
        rec.in_pkts = flow.reply_counters.pkts;
        rec.in_bytes = flow.reply_counters.bytes;
    } else {
        // local <-> local or remote <-> remote
        return None;
    }

    if protocols.lookup(rec.proto, rec.dst_port).is_none() {
        rec.proto = 0;
        rec.dst_port = 0;
    }

    Some(rec)
}

fn commit_record(state: &State, rec: &Record) {
    let mut db = state.db.borrow_mut();
    let res = if rec.count != 0 {
        db.insert(rec)
    } else {
        db.update(rec)
    };
    match res {
        Ok(()) => {}
        // a refresh for a flow this store never saw being opened
        Err(Error::NotFound) => {}
        Err(e) => log::warn!("unable to account flow: {e}"),
    }
}

/// The tail of the ingest pipeline: resolve the local host's MAC and
/// store the record. A cache miss defers the insert by ~500 ms so the
/// neighbour table has a chance to learn the address first.
fn process_flow(state: &Rc<State>, flow: &Flow, allow_insert: bool, update_mac: bool) {
    let Some(mut rec) = classify_flow(flow, &state.args.subnets, &state.protocols, allow_insert)
    else {
        return;
    };

    if let Some(mac) = state.neighbors.borrow().lookup(rec.family, &rec.src_addr) {
        rec.src_mac = mac;
        commit_record(state, &rec);
        return;
    }

    if !update_mac {
        commit_record(state, &rec);
        return;
    }

    // tie the number of pending lookups to the database limit so they
    // cannot gobble up unbounded memory
    let limit = state.db.borrow().limit();
    if limit > 0 && state.pending_inserts.get() >= limit {
        log::warn!("too many pending MAC address lookups");
        commit_record(state, &rec);
        return;
    }

    state.pending_inserts.set(state.pending_inserts.get() + 1);
    let state = Rc::clone(state);
    tokio::task::spawn_local(async move {
        tokio::time::sleep(DELAYED_INSERT).await;

        if state
            .neighbors
            .borrow_mut()
            .refresh(rec.family, &rec.src_addr)
            .is_ok()
        {
            if let Some(mac) = state.neighbors.borrow().lookup(rec.family, &rec.src_addr) {
                rec.src_mac = mac;
            }
        }

        commit_record(&state, &rec);
        state
            .pending_inserts
            .set(state.pending_inserts.get().saturating_sub(1));
    });
}

/// Close the period if the calendar has moved past it. On rollover the
/// archived store is reset, a zeroing dump carries still-open flows
/// into the new period, and `Stale` is reported so the refresh timer
/// skips its own dump.
async fn maybe_archive(state: &Rc<State>) -> Result<()> {
    let next = state.interval.timestamp(0);
    let rolled = state.db.borrow_mut().archive(
        next,
        &state.args.database_dir,
        state.args.compress,
    )?;

    if rolled {
        log::info!("accounting period rolled over to {next}");
        dump(state, true).await?;
        return Err(Error::Stale);
    }
    Ok(())
}

async fn handle_events(state: &Rc<State>, buf: &[u8]) {
    match maybe_archive(state).await {
        Ok(()) | Err(Error::Stale) => {}
        Err(e) => log::error!("unable to archive database: {e}"),
    }

    let parsed = conntrack::parse_datagram(buf);
    for flow in &parsed.flows {
        process_flow(state, flow, flow.new_flow, flow.new_flow);
    }
}

/// Run a full conntrack dump to completion, feeding every entry through
/// the ingest pipeline. `allow_insert` decides whether unseen flows may
/// create records (rollover carry-over) or only refresh existing ones.
async fn dump(state: &Rc<State>, allow_insert: bool) -> Result<()> {
    state.conntrack.request_dump()?;

    let mut buf = vec![0u8; RECV_BUF];
    loop {
        let len = state.conntrack.recv(&mut buf).await.map_err(Error::from)?;
        let parsed = conntrack::parse_datagram(&buf[..len]);

        for flow in &parsed.flows {
            process_flow(state, flow, allow_insert, true);
        }

        if let Some(errno) = parsed.error {
            return Err(Error::Io(io::Error::from_raw_os_error(errno)));
        }
        if parsed.done {
            return Ok(());
        }
    }
}

async fn handle_refresh(state: &Rc<State>) {
    match maybe_archive(state).await {
        Ok(()) => {}
        // rolled over; the carry-over dump already refreshed everything
        Err(Error::Stale) => return,
        Err(e) => {
            log::error!("unable to archive database: {e}");
            return;
        }
    }

    if let Err(e) = dump(state, false).await {
        log::warn!("unable to dump conntrack: {e}");
        return;
    }

    if let Err(e) = state.db.borrow_mut().save(&state.args.tempdir, 0, false) {
        log::warn!("unable to write scratch snapshot: {e}");
    }
}

/// Save the live store under the current period stamp. A pristine
/// conflict means storage with pre-existing data appeared after
/// startup: merge it in, then write. The first attempt's outcome is
/// returned so the control socket can report it.
pub fn save_persistent(state: &State) -> Result<()> {
    let timestamp = state.interval.timestamp(0);
    let dir = &state.args.database_dir;
    let compress = state.args.compress;

    let res = state.db.borrow_mut().save(dir, timestamp, compress);
    match &res {
        Err(Error::Exists) => {
            log::warn!("existing database found, merging values");
            let mut db = state.db.borrow_mut();
            if let Err(e) = db.load(dir, timestamp) {
                log::error!("unable to load existing database: {e}");
            }
            if let Err(e) = db.save(dir, timestamp, compress) {
                log::error!("unable to save database: {e}");
            }
        }
        Err(e) => log::error!("unable to save database: {e}"),
        Ok(()) => {}
    }
    res
}

fn shutdown(state: &State, clear_scratch: bool) -> i32 {
    let _ = save_persistent(state);

    if clear_scratch {
        let _ = fs::remove_file(state.args.tempdir.join("0.db"));
    } else if let Err(e) = state.db.borrow_mut().save(&state.args.tempdir, 0, false) {
        log::warn!("unable to write scratch snapshot: {e}");
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::tests::build_event;
    use std::io::Cursor;

    fn subnets() -> Vec<Subnet> {
        vec!["192.168.1.0/24".parse().unwrap()]
    }

    fn protocols() -> Protocols {
        Protocols::parse(Cursor::new("6 443 https\n6 80 http\n17 53 dns\n")).unwrap()
    }

    fn only_flow(buf: &[u8]) -> Flow {
        let parsed = conntrack::parse_datagram(buf);
        assert_eq!(parsed.flows.len(), 1);
        parsed.flows[0]
    }

    #[test]
    fn classifies_outbound_connection() {
        let flow = only_flow(&build_event(
            true,
            (&[192, 168, 1, 10], 54321, &[8, 8, 8, 8], 443, 6),
            (1, 64, 1, 1024),
        ));

        let rec = classify_flow(&flow, &subnets(), &protocols(), flow.new_flow).unwrap();
        assert_eq!(rec.family, libc::AF_INET as u8);
        assert_eq!(rec.proto, 6);
        assert_eq!(rec.dst_port, 443);
        assert_eq!(&rec.src_addr[..4], &[192, 168, 1, 10]);
        assert_eq!(rec.count, 1);
        assert_eq!(rec.out_pkts, 1);
        assert_eq!(rec.out_bytes, 64);
        assert_eq!(rec.in_pkts, 1);
        assert_eq!(rec.in_bytes, 1024);
    }

    #[test]
    fn classifies_inbound_connection() {
        // remote peer connecting to a local service
        let flow = only_flow(&build_event(
            true,
            (&[203, 0, 113, 7], 40000, &[192, 168, 1, 10], 80, 6),
            (5, 500, 4, 400),
        ));

        let rec = classify_flow(&flow, &subnets(), &protocols(), true).unwrap();
        assert_eq!(rec.dst_port, 80);
        assert_eq!(&rec.src_addr[..4], &[192, 168, 1, 10]);
        // original direction carries the local host's download
        assert_eq!(rec.in_pkts, 5);
        assert_eq!(rec.in_bytes, 500);
        assert_eq!(rec.out_pkts, 4);
        assert_eq!(rec.out_bytes, 400);
    }

    #[test]
    fn merges_counter_refresh_into_existing_flow() {
        let mut db = Database::period(Interval::Monthly(1), 20250101, false, 0);

        let new = only_flow(&build_event(
            true,
            (&[192, 168, 1, 10], 54321, &[8, 8, 8, 8], 443, 6),
            (1, 64, 1, 1024),
        ));
        let rec = classify_flow(&new, &subnets(), &protocols(), true).unwrap();
        db.insert(&rec).unwrap();

        let refresh = only_flow(&build_event(
            false,
            (&[192, 168, 1, 10], 54321, &[8, 8, 8, 8], 443, 6),
            (2, 100, 2, 2000),
        ));
        let rec = classify_flow(&refresh, &subnets(), &protocols(), false).unwrap();
        assert_eq!(rec.count, 0);
        db.update(&rec).unwrap();

        assert_eq!(db.entries(), 1);
        let total = db.records().next().copied().unwrap();
        assert_eq!(total.count, 1);
        assert_eq!(total.out_pkts, 3);
        assert_eq!(total.out_bytes, 164);
        assert_eq!(total.in_pkts, 3);
        assert_eq!(total.in_bytes, 3024);
    }

    #[test]
    fn unknown_application_buckets_as_other() {
        let flow = only_flow(&build_event(
            true,
            (&[192, 168, 1, 20], 1234, &[1, 1, 1, 1], 9999, 17),
            (1, 100, 0, 0),
        ));

        let rec = classify_flow(&flow, &subnets(), &protocols(), true).unwrap();
        assert_eq!(rec.proto, 0);
        assert_eq!(rec.dst_port, 0);
        assert_eq!(&rec.src_addr[..4], &[192, 168, 1, 20]);
    }

    #[test]
    fn drops_unattributable_flows() {
        // local <-> local
        let flow = only_flow(&build_event(
            true,
            (&[192, 168, 1, 10], 1000, &[192, 168, 1, 11], 80, 6),
            (1, 1, 1, 1),
        ));
        assert!(classify_flow(&flow, &subnets(), &protocols(), true).is_none());

        // remote <-> remote
        let flow = only_flow(&build_event(
            true,
            (&[8, 8, 8, 8], 1000, &[9, 9, 9, 9], 80, 6),
            (1, 1, 1, 1),
        ));
        assert!(classify_flow(&flow, &subnets(), &protocols(), true).is_none());

        // no configured subnets: nothing is local
        let flow = only_flow(&build_event(
            true,
            (&[192, 168, 1, 10], 1000, &[8, 8, 8, 8], 80, 6),
            (1, 1, 1, 1),
        ));
        assert!(classify_flow(&flow, &[], &protocols(), true).is_none());
    }
}
