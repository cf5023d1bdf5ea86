//! Locked on-disk state.
//!
//! Two files under `<TFTPRoot>/corral/`: `reservations.json` (a JSON
//! map of id to reservation) and `schedule.bin` (the bincoded slice
//! run). Both are held under an exclusive advisory `flock` for the
//! whole invocation; a crashed process drops its locks automatically,
//! so there is no stale-lock recovery to do. Writes are
//! truncate-rewrite-sync under that lock.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::reservation::Reservation;
use crate::schedule::Schedule;

/// The reservation table keyed by id.
pub type ReservationMap = HashMap<u64, Reservation>;

/// Exclusive handle on both state files.
///
/// Locks release when the store drops (or the process exits).
pub struct Store {
    reservations: File,
    schedule: File,
}

impl Store {
    /// Open (creating if missing) and exclusively lock both state
    /// files under `state_dir`. Blocks while another invocation holds
    /// the locks.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| Error::store("create state dir", e.to_string()))?;

        let reservations = open_locked(&state_dir.join("reservations.json"))?;
        let schedule = open_locked(&state_dir.join("schedule.bin"))?;

        Ok(Self {
            reservations,
            schedule,
        })
    }

    /// Parse both files. Empty files load as empty state; anything
    /// else that fails to parse is fatal for the invocation.
    pub fn load(&mut self) -> Result<(ReservationMap, Schedule)> {
        self.reservations
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::store("read reservations", e.to_string()))?;
        self.schedule
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::store("read schedule", e.to_string()))?;

        let mut raw = Vec::new();
        self.reservations
            .read_to_end(&mut raw)
            .map_err(|e| Error::store("read reservations", e.to_string()))?;
        let reservations: ReservationMap = if raw.is_empty() {
            ReservationMap::new()
        } else {
            serde_json::from_slice(&raw)
                .map_err(|e| Error::store("parse reservations", e.to_string()))?
        };

        let mut raw = Vec::new();
        self.schedule
            .read_to_end(&mut raw)
            .map_err(|e| Error::store("read schedule", e.to_string()))?;
        let schedule: Schedule = if raw.is_empty() {
            Schedule::default()
        } else {
            bincode::deserialize(&raw)
                .map_err(|e| Error::store("parse schedule", e.to_string()))?
        };

        Ok((reservations, schedule))
    }

    /// Rewrite both files: truncate, write, sync.
    pub fn save(&mut self, reservations: &ReservationMap, schedule: &Schedule) -> Result<()> {
        let json = serde_json::to_vec(reservations)
            .map_err(|e| Error::store("encode reservations", e.to_string()))?;
        rewrite(&mut self.reservations, &json)
            .map_err(|e| Error::store("write reservations", e.to_string()))?;

        let bin = bincode::serialize(schedule)
            .map_err(|e| Error::store("encode schedule", e.to_string()))?;
        rewrite(&mut self.schedule, &bin)
            .map_err(|e| Error::store("write schedule", e.to_string()))?;

        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.reservations.as_raw_fd(), libc::LOCK_UN);
            libc::flock(self.schedule.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn open_locked(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o664)
        .open(path)
        .map_err(|e| Error::store("open", format!("{}: {}", path.display(), e)))?;

    // Blocks until any other invocation releases; failure here means
    // the operator has to retry.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(Error::Lock(format!(
            "{}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(file)
}

fn rewrite(file: &mut File, data: &[u8]) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(data)?;
    file.sync_all()
}
