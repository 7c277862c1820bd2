//! On-disk index from created outputs to their TTL slot.
//!
//! `txidfile.dat` holds, block after block, the accumulated outputs of every
//! block as fixed-size records sorted by key:
//!
//! ```text
//! 0..6    txid prefix
//! 6..10   u32 vout
//! 10..14  u32 TTL slot
//! ```
//!
//! `txidoffsets.dat` holds one big-endian i64 per block from height 1: the
//! offset just past the last record of the block in `txidfile.dat`. A block
//! starts where its predecessor ends. The offset is written once the records
//! are on disk, so records past the last offset belong to no block and are
//! dropped on open. All integers are big-endian, so records compare by key as
//! raw bytes.

use crate::{Error, Result};
use bitcoin::Txid;
use bitcoin::hashes::Hash;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const TXID_FILE: &str = "txidfile.dat";
pub const TXID_OFFSET_FILE: &str = "txidoffsets.dat";

pub const PREFIX_SIZE: usize = 6;
const KEY_SIZE: usize = PREFIX_SIZE + 4;
pub const RECORD_SIZE: u64 = KEY_SIZE as u64 + 4;
const OFFSET_SIZE: u64 = 8;

/// Search key of an output: the txid prefix and the output index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxoKey([u8; KEY_SIZE]);

impl TxoKey {
    pub fn new(txid: &Txid, vout: u32) -> Self {
        let mut key = [0u8; KEY_SIZE];
        key[..PREFIX_SIZE].copy_from_slice(&txid.as_byte_array()[..PREFIX_SIZE]);
        key[PREFIX_SIZE..].copy_from_slice(&vout.to_be_bytes());
        Self(key)
    }

    fn prefix(&self) -> &[u8] {
        &self.0[..PREFIX_SIZE]
    }
}

/// Output created by a block, owning TTL slot `slot` of its proof record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedTxo {
    pub txid: Txid,
    pub vout: u32,
    pub slot: u32,
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// End of the records of `height`, 0 below height 1.
fn end_offset(offsets: &mut File, height: i32) -> Result<u64> {
    if height < 1 {
        return Ok(0);
    }
    read_offset(offsets, height)
}

fn read_offset(offsets: &mut File, height: i32) -> Result<u64> {
    let mut buf = [0u8; 8];
    offsets.seek(SeekFrom::Start(OFFSET_SIZE * (height as u64 - 1)))?;
    offsets.read_exact(&mut buf)?;
    let offset = i64::from_be_bytes(buf);
    u64::try_from(offset)
        .map_err(|_| Error::Inconsistent(format!("offset {offset} of block {height}")))
}

/// Writing side of the index, owned by the sort/write stage.
pub struct TxoIndexWriter {
    txids: File,
    offsets: File,
    txids_len: u64,
    /// Last indexed block, 0 when empty.
    height: i32,
}

impl TxoIndexWriter {
    /// Opens the index in `dir`, dropping every block above `keep_height`.
    pub fn open(dir: impl AsRef<Path>, keep_height: i32) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut txids = open_rw(&dir.join(TXID_FILE))?;
        let mut offsets = open_rw(&dir.join(TXID_OFFSET_FILE))?;

        let indexed = (offsets.metadata()?.len() / OFFSET_SIZE) as i64;
        if indexed < i64::from(keep_height) {
            return Err(Error::Inconsistent(format!(
                "index covers {indexed} blocks, {keep_height} required"
            )));
        }

        let txids_len = end_offset(&mut offsets, keep_height)?;
        let len = txids.metadata()?.len();
        if txids_len > len || txids_len % RECORD_SIZE != 0 {
            return Err(Error::Inconsistent(format!(
                "block {keep_height} ends at byte {txids_len}, {len} bytes indexed"
            )));
        }
        if len > txids_len && i64::from(keep_height) == indexed {
            tracing::warn!(
                records = (len - txids_len) / RECORD_SIZE,
                "Dropping TTL index records of an unfinished block"
            );
        }
        offsets.set_len(OFFSET_SIZE * keep_height as u64)?;
        txids.set_len(txids_len)?;

        if indexed > i64::from(keep_height) {
            tracing::info!(from = indexed, to = keep_height, "Truncated TTL index");
        }

        Ok(Self {
            txids,
            offsets,
            txids_len,
            height: keep_height,
        })
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Appends the outputs created at `height`, which must be the next block.
    pub fn append_block(&mut self, height: i32, mut created: Vec<CreatedTxo>) -> Result<()> {
        if height != self.height + 1 {
            return Err(Error::Inconsistent(format!(
                "indexing block {height} after block {}",
                self.height
            )));
        }

        created.sort_unstable_by_key(|txo| TxoKey::new(&txo.txid, txo.vout));
        // Records sharing a prefix are contiguous once sorted.
        for pair in created.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.txid != b.txid && TxoKey::new(&a.txid, 0).prefix() == TxoKey::new(&b.txid, 0).prefix() {
                return Err(Error::PrefixCollision {
                    height,
                    first: a.txid,
                    second: b.txid,
                });
            }
        }
        let mut records = Vec::with_capacity(created.len() * RECORD_SIZE as usize);
        for txo in &created {
            records.extend_from_slice(&TxoKey::new(&txo.txid, txo.vout).0);
            records.extend_from_slice(&txo.slot.to_be_bytes());
        }

        self.txids.seek(SeekFrom::Start(self.txids_len))?;
        self.txids.write_all(&records)?;
        self.txids.flush()?;

        let end = self.txids_len + records.len() as u64;
        self.offsets.seek(SeekFrom::End(0))?;
        self.offsets.write_all(&(end as i64).to_be_bytes())?;
        self.offsets.flush()?;

        self.txids_len = end;
        self.height = height;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.txids.sync_all()?;
        self.offsets.sync_all()?;
        Ok(())
    }
}

/// Forces the index files in `dir` to disk, whichever handle wrote them.
pub fn sync_files(dir: &Path) -> Result<()> {
    for name in [TXID_FILE, TXID_OFFSET_FILE] {
        OpenOptions::new().write(true).open(dir.join(name))?.sync_all()?;
    }
    Ok(())
}

/// Reading side of the index, owned by the lookup stage.
pub struct TxoIndexReader {
    txids: File,
    offsets: File,
}

impl TxoIndexReader {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            txids: File::open(dir.join(TXID_FILE))?,
            offsets: File::open(dir.join(TXID_OFFSET_FILE))?,
        })
    }

    /// Byte range of the records of `height`.
    fn region(&mut self, height: i32) -> Result<(u64, u64)> {
        if height < 1 {
            return Err(Error::Inconsistent(format!("no index for block {height}")));
        }
        let indexed = self.offsets.metadata()?.len() / OFFSET_SIZE;
        if (height as u64) > indexed {
            return Err(Error::Inconsistent(format!(
                "block {height} is not indexed, {indexed} blocks indexed"
            )));
        }
        let start = end_offset(&mut self.offsets, height - 1)?;
        let end = read_offset(&mut self.offsets, height)?;
        if end < start || (end - start) % RECORD_SIZE != 0 {
            return Err(Error::Inconsistent(format!(
                "block {height} spans bytes {start}..{end}"
            )));
        }
        Ok((start, end))
    }

    /// Reads every record of `height` in one go.
    fn read_region(&mut self, height: i32) -> Result<Vec<u8>> {
        let (start, end) = self.region(height)?;
        let mut records = vec![0u8; (end - start) as usize];
        self.txids.seek(SeekFrom::Start(start))?;
        self.txids.read_exact(&mut records)?;
        Ok(records)
    }

    /// TTL slot of output `txid:vout` created at `height`.
    pub fn lookup(&mut self, height: i32, txid: &Txid, vout: u32) -> Result<u32> {
        let mut slots = self.lookup_block(height, &[(*txid, vout)])?;
        slots
            .pop()
            .ok_or_else(|| Error::Inconsistent(format!("no slot for {txid}:{vout}")))
    }

    /// TTL slots of several outputs created at `height`, in the order asked.
    ///
    /// The records of the block are read once and searched in memory.
    pub fn lookup_block(&mut self, height: i32, outputs: &[(Txid, u32)]) -> Result<Vec<u32>> {
        let records = self.read_region(height)?;
        outputs
            .iter()
            .map(|(txid, vout)| {
                search(&records, &TxoKey::new(txid, *vout)).ok_or_else(|| {
                    tracing::debug!(height, %txid, vout, "Output missing from index");
                    Error::TxNotFound {
                        height,
                        txid: *txid,
                        vout: *vout,
                    }
                })
            })
            .collect()
    }
}

/// Binary search of `key` over records sorted by key.
fn search(records: &[u8], key: &TxoKey) -> Option<u32> {
    let record_size = RECORD_SIZE as usize;
    let (mut lo, mut hi) = (0, records.len() / record_size);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let record = &records[mid * record_size..(mid + 1) * record_size];
        match record[..KEY_SIZE].cmp(&key.0) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => {
                let mut slot = [0u8; 4];
                slot.copy_from_slice(&record[KEY_SIZE..]);
                return Some(u32::from_be_bytes(slot));
            }
        }
    }
    None
}
