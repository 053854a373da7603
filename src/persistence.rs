//! Snapshot persistence (spec.md §4.C, component C).
//!
//! CCDB v2: a fixed-width reimplementation of the format spec.md §4.C and
//! §9 flag as non-portable (native `size_t`/enum widths). Every length here
//! is an explicit little-endian `u64`, every tag an explicit `u8`, so the
//! file means the same thing on any two machines that can run this binary —
//! spec.md §9 explicitly sanctions bumping the on-disk version for this.
//!
//! Atomic replace (`.tmp` + rename) and the `fork()`-based background save
//! are grounded on the teacher's `snapshot.rs`, which writes its own
//! point-in-time dumps the same way.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::store::Keyspace;
use crate::types::{Value, ValueType, now_ms};

const MAGIC: &[u8; 4] = b"CCDB";
const VERSION: u8 = 2;
const TAG_STRING: u8 = 0;

/// Writes every live (non-expired) entry to `path` via a `.tmp` file and an
/// atomic rename, so a crash mid-write never leaves a half-written snapshot
/// in place of a good one.
pub fn save(keyspace: &Keyspace, path: &Path) -> io::Result<()> {
    let tmp_path = tmp_path_for(path);
    if let Err(e) = write_tmp(keyspace, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, path)?;
    info!("snapshot written to {}", path.display());
    Ok(())
}

fn write_tmp(keyspace: &Keyspace, tmp_path: &Path) -> io::Result<()> {
    let file = File::create(tmp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])?;

    let now = now_ms();
    for (key, value) in keyspace.iter_live() {
        if value.is_expired_at(now) {
            continue;
        }
        write_entry(&mut writer, key, value)?;
    }
    writer.flush()
}

fn write_entry(writer: &mut impl Write, key: &[u8], value: &Value) -> io::Result<()> {
    writer.write_all(&[TAG_STRING])?;
    writer.write_all(&(key.len() as u64).to_le_bytes())?;
    writer.write_all(key)?;
    writer.write_all(&(value.payload.len() as u64).to_le_bytes())?;
    writer.write_all(&value.payload)?;
    writer.write_all(&value.expiry_ms.to_le_bytes())?;
    Ok(())
}

/// Loads a snapshot into `keyspace`. A missing file is treated as an empty
/// snapshot, not an error — spec.md §4.C: first boot never has one.
/// Entries whose expiry has already passed are skipped rather than loaded
/// and immediately swept.
pub fn load(keyspace: &mut Keyspace, path: &Path) -> io::Result<usize> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no snapshot at {}, starting empty", path.display());
            return Ok(0);
        }
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a CCDB snapshot",
        ));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported CCDB version {}", version[0]),
        ));
    }

    let now = now_ms();
    let mut loaded = 0usize;
    loop {
        let mut tag = [0u8; 1];
        match reader.read(&mut tag)? {
            0 => break,
            _ => {}
        }
        if tag[0] != TAG_STRING {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown value tag {}", tag[0]),
            ));
        }
        let key = read_length_prefixed(&mut reader)?;
        let payload = read_length_prefixed(&mut reader)?;
        let mut expiry_buf = [0u8; 8];
        reader.read_exact(&mut expiry_buf)?;
        let expiry_ms = u64::from_le_bytes(expiry_buf);

        if expiry_ms != 0 && expiry_ms < now {
            continue;
        }
        let mut value = Value::new_string(payload, expiry_ms);
        value.value_type = ValueType::String;
        keyspace.insert(&key, value);
        loaded += 1;
    }

    info!("loaded {} keys from {}", loaded, path.display());
    Ok(loaded)
}

fn read_length_prefixed(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Forks a child process to write the snapshot, so the parent can keep
/// serving clients immediately. Copy-on-write gives the child a private,
/// point-in-time view of the keyspace without holding a lock across the
/// whole write — the same trick the teacher's `fork_and_dump` uses for its
/// checkpoint writer.
///
/// Safety: `fork()` is only safe here because the child's sole job before
/// `_exit` is `save()` and a process exit — no further interaction with
/// Rust runtime state (threads, mutexes held by other threads) that could
/// be left in an inconsistent state across the fork.
pub fn background_save(keyspace: &Keyspace, path: &Path) -> io::Result<()> {
    // SAFETY: the child only ever calls `save` (pure file I/O) and then
    // `libc::_exit`, never touching any lock or thread state inherited
    // from the pre-fork parent.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            let code = match save(keyspace, path) {
                Ok(()) => 0,
                Err(e) => {
                    error!("background save failed: {e}");
                    1
                }
            };
            unsafe { libc::_exit(code) };
        }
        child_pid => {
            info!("background save forked (pid {child_pid})");
            Ok(())
        }
    }
}

/// Reaps any finished background-save children without blocking, so they
/// don't accumulate as zombies. Called from the periodic maintenance tick.
pub fn reap_finished_children() {
    loop {
        let mut status: i32 = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status as *mut i32, libc::WNOHANG) };
        if pid <= 0 {
            if pid < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ECHILD) {
                    warn!("waitpid failed: {err}");
                }
            }
            break;
        }
    }
}
