//! Flat-file store of per-block proof records.
//!
//! Two append-only files live in the store directory:
//!
//! - `proof.dat`: for every height from 1, `i64 record_length ∥ UData`.
//! - `proofoffset.dat`: for every height from 1, the big-endian i64 offset of
//!   its record in `proof.dat`.
//!
//! The offset of a record is appended only once its payload is synced, so
//! the offset file always describes a prefix of durable records. Opening the
//! store drops any payload written past the last offset.

mod error;

pub use self::error::Error;

use bitcoin::consensus::{deserialize, serialize};
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use utreexo_primitives::UData;

pub const PROOF_FILE: &str = "proof.dat";
pub const OFFSET_FILE: &str = "proofoffset.dat";

const OFFSET_SIZE: u64 = 8;
const LENGTH_PREFIX_SIZE: u64 = 8;

pub type Result<T> = std::result::Result<T, Error>;

struct Files {
    proof: File,
    offsets: File,
    /// Height of the last durable record, 0 when empty.
    tip: i32,
    /// End of the last durable record in `proof.dat`.
    proof_len: u64,
    closed: bool,
}

/// Single-writer, multi-reader proof record store.
pub struct ProofStore {
    dir: PathBuf,
    files: Mutex<Files>,
    tip_changed: Condvar,
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn read_i64_at(file: &mut File, offset: u64) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_u32_at(file: &mut File, offset: u64) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

impl Files {
    fn record_offset(&mut self, height: i32) -> Result<u64> {
        if height == 0 {
            return Err(Error::NoProofForGenesis);
        }
        if height < 0 || height > self.tip {
            return Err(Error::HeightNotFound {
                height,
                tip: self.tip,
            });
        }
        let offset = read_i64_at(&mut self.offsets, OFFSET_SIZE * (height as u64 - 1))?;
        u64::try_from(offset)
            .ok()
            .filter(|offset| *offset < self.proof_len)
            .ok_or_else(|| Error::Corrupt(format!("offset {offset} of record {height}")))
    }

    fn read_record(&mut self, height: i32) -> Result<Vec<u8>> {
        let offset = self.record_offset(height)?;
        let len = read_i64_at(&mut self.proof, offset)?;
        let len = u64::try_from(len)
            .ok()
            .filter(|len| offset + LENGTH_PREFIX_SIZE + len <= self.proof_len)
            .ok_or_else(|| Error::Corrupt(format!("length {len} of record {height}")))?;
        let mut payload = vec![0u8; len as usize];
        self.proof.read_exact(&mut payload)?;
        Ok(payload)
    }
}

impl ProofStore {
    /// Opens the store in `dir`, creating it when missing.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut proof = open_rw(&dir.join(PROOF_FILE))?;
        let mut offsets = open_rw(&dir.join(OFFSET_FILE))?;

        let offsets_len = offsets.metadata()?.len();
        if offsets_len % OFFSET_SIZE != 0 {
            tracing::warn!(offsets_len, "Dropping partial proof offset entry");
            offsets.set_len(offsets_len - offsets_len % OFFSET_SIZE)?;
        }
        let count = offsets.metadata()?.len() / OFFSET_SIZE;
        let tip = i32::try_from(count)
            .map_err(|_| Error::Corrupt(format!("{count} proof offsets")))?;

        let proof_len = if tip == 0 {
            0
        } else {
            let last = read_i64_at(&mut offsets, OFFSET_SIZE * (count - 1))?;
            let last = u64::try_from(last)
                .map_err(|_| Error::Corrupt(format!("offset {last} of record {tip}")))?;
            let len = read_i64_at(&mut proof, last)
                .map_err(|err| Error::Corrupt(format!("record {tip} unreadable: {err}")))?;
            let len = u64::try_from(len)
                .map_err(|_| Error::Corrupt(format!("length {len} of record {tip}")))?;
            last + LENGTH_PREFIX_SIZE + len
        };

        let on_disk = proof.metadata()?.len();
        if on_disk < proof_len {
            return Err(Error::Corrupt(format!(
                "{PROOF_FILE} holds {on_disk} bytes, offsets describe {proof_len}"
            )));
        }
        if on_disk > proof_len {
            tracing::warn!(
                dropped = on_disk - proof_len,
                tip,
                "Truncating proof record without offset"
            );
            proof.set_len(proof_len)?;
            proof.sync_all()?;
        }

        tracing::debug!(?dir, tip, "Opened proof store");

        Ok(Self {
            dir,
            files: Mutex::new(Files {
                proof,
                offsets,
                tip,
                proof_len,
                closed: false,
            }),
            tip_changed: Condvar::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Height of the last durable record, 0 when empty.
    pub fn tip(&self) -> i32 {
        self.files.lock().tip
    }

    /// Appends the record of `udata.height`, which must be `tip + 1`.
    pub fn append(&self, udata: &UData) -> Result<()> {
        let payload = serialize(udata);
        let mut files = self.files.lock();

        let expected = files.tip + 1;
        if udata.height != expected {
            return Err(Error::OutOfOrder {
                expected,
                got: udata.height,
            });
        }

        let offset = files.proof_len;
        files.proof.seek(SeekFrom::Start(offset))?;
        files.proof.write_all(&(payload.len() as i64).to_be_bytes())?;
        files.proof.write_all(&payload)?;
        files.proof.sync_data()?;

        files.offsets.seek(SeekFrom::End(0))?;
        files.offsets.write_all(&(offset as i64).to_be_bytes())?;
        files.offsets.sync_data()?;

        files.proof_len = offset + LENGTH_PREFIX_SIZE + payload.len() as u64;
        files.tip = expected;
        drop(files);

        self.tip_changed.notify_all();
        Ok(())
    }

    /// Drops every record above `height`.
    pub fn truncate(&self, height: i32) -> Result<()> {
        let mut files = self.files.lock();
        if height < 0 || height > files.tip {
            return Err(Error::HeightNotFound {
                height,
                tip: files.tip,
            });
        }
        if height == files.tip {
            return Ok(());
        }

        let proof_len = files.record_offset(height + 1)?;
        files.proof.set_len(proof_len)?;
        files.proof.sync_all()?;
        files.offsets.set_len(OFFSET_SIZE * height as u64)?;
        files.offsets.sync_all()?;

        tracing::info!(from = files.tip, to = height, "Truncated proof store");
        files.proof_len = proof_len;
        files.tip = height;
        Ok(())
    }

    /// Serialized [`UData`] of `height`.
    pub fn get_raw(&self, height: i32) -> Result<Vec<u8>> {
        self.files.lock().read_record(height)
    }

    pub fn get_udata(&self, height: i32) -> Result<UData> {
        let payload = self.get_raw(height)?;
        let udata: UData = deserialize(&payload).map_err(utreexo_primitives::Error::from)?;
        if udata.height != height {
            return Err(Error::Corrupt(format!(
                "record {height} claims height {}",
                udata.height
            )));
        }
        Ok(udata)
    }

    /// Overwrites TTL slot `slot` of the record of `height`.
    pub fn write_ttl(&self, height: i32, slot: u32, ttl: i32) -> Result<()> {
        self.write_ttls(height, &[(slot, ttl)])
    }

    /// Overwrites several TTL slots of the record of `height`.
    pub fn write_ttls(&self, height: i32, ttls: &[(u32, i32)]) -> Result<()> {
        let mut files = self.files.lock();
        let udata_start = files.record_offset(height)? + LENGTH_PREFIX_SIZE;
        let num_ttls = read_u32_at(&mut files.proof, udata_start + 4)?;

        for &(slot, ttl) in ttls {
            if slot >= num_ttls {
                return Err(Error::TtlSlotOutOfRange {
                    height,
                    slot,
                    num_ttls,
                });
            }
            files
                .proof
                .seek(SeekFrom::Start(udata_start + UData::ttl_slot_offset(slot)))?;
            files.proof.write_all(&ttl.to_be_bytes())?;
        }
        Ok(())
    }

    /// Blocks until the record of `height` is durable or the store is closed.
    ///
    /// Returns whether the record is available. With a `timeout`, gives up
    /// once it elapses.
    pub fn wait_for_height(&self, height: i32, timeout: Option<Duration>) -> bool {
        let mut files = self.files.lock();
        while files.tip < height && !files.closed {
            match timeout {
                Some(timeout) => {
                    if self.tip_changed.wait_for(&mut files, timeout).timed_out() {
                        break;
                    }
                }
                None => self.tip_changed.wait(&mut files),
            }
        }
        files.tip >= height
    }

    pub fn is_closed(&self) -> bool {
        self.files.lock().closed
    }

    /// Syncs both files.
    pub fn flush(&self) -> Result<()> {
        let files = self.files.lock();
        files.proof.sync_all()?;
        files.offsets.sync_all()?;
        Ok(())
    }

    /// Flushes and wakes every waiter; later waits return immediately.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.files.lock().closed = true;
        self.tip_changed.notify_all();
        tracing::debug!(dir = ?self.dir, "Closed proof store");
        Ok(())
    }
}
