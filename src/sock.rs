//! Control endpoint: a local stream socket answering one short request
//! per connection. Clients are expected to be non-interactive, so the
//! request line has a tight read deadline; responses are streamed with
//! full-write loops.

use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use byteorder::{ByteOrder, NativeEndian};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::monitor::{save_persistent, State};

const REQUEST_TIMEOUT: Duration = Duration::from_millis(100);
const REQUEST_MAX: usize = 32;

/// Bind the control socket, replacing a stale socket file left behind
/// by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.file_type().is_socket() {
            std::fs::remove_file(path)?;
        }
    }

    Ok(UnixListener::bind(path)?)
}

/// Handle one accepted client connection to completion. The listener is
/// not polled again until this returns, so at most one client is ever
/// in flight.
pub async fn serve_client(state: &Rc<State>, mut stream: UnixStream) {
    let mut buf = [0u8; REQUEST_MAX];
    let len = match tokio::time::timeout(REQUEST_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(len)) if len > 0 => len,
        Ok(Ok(_)) => return,
        Ok(Err(e)) => {
            log::warn!("control socket read failed: {e}");
            return;
        }
        // idle client, drop the session
        Err(_) => return,
    };

    let request = String::from_utf8_lossy(&buf[..len]).into_owned();
    let mut words = request.split_whitespace();
    let Some(cmd) = words.next() else { return };
    let arg = words.next();

    let res = match cmd {
        "dump" => handle_dump(state, &mut stream, arg).await,
        "list" => handle_list(state, &mut stream).await,
        "commit" => handle_commit(state, &mut stream).await,
        _ => return,
    };

    if let Err(e) = res {
        log::warn!("unable to handle '{cmd}' command: {e}");
    }
}

/// `dump [stamp]`: header plus record stream; stamp 0 or absent selects
/// the live store, anything else loads the archived period on the fly.
async fn handle_dump(state: &Rc<State>, stream: &mut UnixStream, arg: Option<&str>) -> Result<()> {
    let timestamp = match arg {
        None => 0,
        Some(arg) => arg
            .parse::<u32>()
            .map_err(|_| Error::Invalid("dump timestamp"))?,
    };

    let mut payload = Vec::new();
    if timestamp == 0 {
        let db = state.db.borrow();
        db.header().write_to(&mut payload)?;
        for rec in db.records() {
            rec.write_to(&mut payload)?;
        }
    } else {
        let mut db = Database::period(state.interval, timestamp, false, 0);
        db.load(&state.args.database_dir, timestamp)?;
        db.header().write_to(&mut payload)?;
        for rec in db.records() {
            rec.write_to(&mut payload)?;
        }
    }

    stream.write_all(&payload).await?;
    Ok(())
}

/// `list`: stream stamps in descending order, one period at a time,
/// stopping at the first period without an archive.
async fn handle_list(state: &Rc<State>, stream: &mut UnixStream) -> Result<()> {
    let mut delta = 0;
    loop {
        let timestamp = state.interval.timestamp(delta);
        delta -= 1;

        match Database::probe(&state.args.database_dir, timestamp) {
            Ok(()) => {
                let mut word = [0u8; 4];
                NativeEndian::write_u32(&mut word, timestamp);
                stream.write_all(&word).await?;
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                log::warn!("corrupted database detected: {timestamp} ({e})");
                return Ok(());
            }
        }
    }
}

/// `commit`: save the live store, reply `<code> <message>` with the
/// first attempt's outcome (`0 ok` on success).
async fn handle_commit(state: &Rc<State>, stream: &mut UnixStream) -> Result<()> {
    let reply = match save_persistent(state) {
        Ok(()) => "0 ok".to_owned(),
        Err(e) => format!("{} {}", e.code(), e),
    };

    stream.write_all(reply.as_bytes()).await?;
    Ok(())
}
