//! The TTL pipeline: four stages, each on its own thread, linked by bounded channels.
//!
//! ```text
//!            created outputs              go(height)
//! splitter ──────────────────> sort/write ──────────┐
//!     │                                             v
//!     └──────── spent outputs ────────────────> lookup ──> result writer ──> proof store
//! ```
//!
//! Closing the input drains every stage in order. A failing stage drops its
//! channels, which stops the stages around it.

use crate::index::{self, CreatedTxo, TxoIndexReader, TxoIndexWriter};
use crate::{Error, Result};
use bitcoin::{Block, Txid};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use utreexo_primitives::{BlockUndo, block_add_leaf_data, block_to_del_leaves, dedupe_block};
use utreexo_proof_store::ProofStore;

/// Capacity of every inter-stage channel, in blocks.
pub const CHANNEL_CAPACITY: usize = 10;

/// A block entering the pipeline along with its undo record.
#[derive(Debug, Clone)]
pub struct TtlBlock {
    pub height: i32,
    pub block: Arc<Block>,
    pub undo: Arc<BlockUndo>,
}

struct BlockTxos {
    height: i32,
    created: Vec<CreatedTxo>,
}

struct SpentTxo {
    txid: Txid,
    vout: u32,
    create_height: i32,
}

struct BlockSpends {
    height: i32,
    spent: Vec<SpentTxo>,
}

/// TTL slot to fill: slot `slot` of the record of `create_height`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlResult {
    pub create_height: i32,
    pub slot: u32,
}

struct BlockTtls {
    height: i32,
    results: Vec<TtlResult>,
}

#[derive(Clone, Copy)]
struct WrittenState {
    height: i32,
    stopped: bool,
}

/// Last block whose TTLs reached the proof store.
struct Written {
    state: Mutex<WrittenState>,
    changed: Condvar,
}

impl Written {
    fn new(height: i32) -> Self {
        Self {
            state: Mutex::new(WrittenState {
                height,
                stopped: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn advance(&self, height: i32) {
        self.state.lock().height = height;
        self.changed.notify_all();
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
    }

    /// Waits until block `height` is written; `false` if the writer stopped first.
    fn wait_for(&self, height: i32) -> bool {
        let mut state = self.state.lock();
        while state.height < height && !state.stopped {
            self.changed.wait(&mut state);
        }
        state.height >= height
    }
}

/// Handle to a running pipeline.
pub struct TtlPipeline {
    input: Sender<TtlBlock>,
    stages: Vec<(&'static str, JoinHandle<Result<()>>)>,
    written: Arc<Written>,
    index_dir: PathBuf,
}

fn spawn_stage(
    name: &'static str,
    stage: impl FnOnce() -> Result<()> + Send + 'static,
) -> Result<(&'static str, JoinHandle<Result<()>>)> {
    let handle = std::thread::Builder::new()
        .name(format!("ttl-{name}"))
        .spawn(move || {
            let result = stage();
            match &result {
                Ok(()) => tracing::debug!("TTL {name} stage finished"),
                Err(Error::ChannelClosed(_)) => {}
                Err(err) => tracing::error!(?err, "TTL {name} stage failed"),
            }
            result
        })?;
    Ok((name, handle))
}

impl TtlPipeline {
    /// Starts the pipeline over the index in `index_dir`, rolled back to
    /// `synced_height`; the first block sent must be `synced_height + 1`.
    pub fn spawn(index_dir: &Path, synced_height: i32, store: Arc<ProofStore>) -> Result<Self> {
        let index = TxoIndexWriter::open(index_dir, synced_height)?;
        let reader = TxoIndexReader::open(index_dir)?;

        let (input, input_rx) = channel(CHANNEL_CAPACITY);
        let (txos_tx, txos_rx) = channel(CHANNEL_CAPACITY);
        let (spends_tx, spends_rx) = channel(CHANNEL_CAPACITY);
        let (go_tx, go_rx) = channel(CHANNEL_CAPACITY);
        let (ttls_tx, ttls_rx) = channel(CHANNEL_CAPACITY);
        let written = Arc::new(Written::new(synced_height));
        let writer_progress = written.clone();

        let stages = vec![
            spawn_stage("splitter", move || split(input_rx, txos_tx, spends_tx))?,
            spawn_stage("sort-write", move || sort_write(txos_rx, go_tx, index))?,
            spawn_stage("lookup", move || lookup(spends_rx, go_rx, ttls_tx, reader))?,
            spawn_stage("result-writer", move || {
                let result = write_results(ttls_rx, store, &writer_progress);
                writer_progress.stop();
                result
            })?,
        ];

        Ok(Self {
            input,
            stages,
            written,
            index_dir: index_dir.to_path_buf(),
        })
    }

    /// Waits until the TTLs spent by every block up to `height` are in the
    /// proof store, then forces the index to disk.
    ///
    /// The store itself still needs a flush to make those writes durable.
    pub fn checkpoint(&self, height: i32) -> Result<()> {
        if !self.written.wait_for(height) {
            return Err(Error::ChannelClosed("result-writer"));
        }
        index::sync_files(&self.index_dir)
    }

    /// Queues a block, waiting while the pipeline is full.
    ///
    /// Must not be called from an async context.
    pub fn send(&self, block: TtlBlock) -> Result<()> {
        self.input
            .blocking_send(block)
            .map_err(|_| Error::ChannelClosed("splitter"))
    }

    /// Queues a block from an async context.
    pub async fn send_async(&self, block: TtlBlock) -> Result<()> {
        self.input
            .send(block)
            .await
            .map_err(|_| Error::ChannelClosed("splitter"))
    }

    /// Closes the input and waits for every stage to drain.
    ///
    /// Returns the root cause when a stage failed.
    pub fn finish(self) -> Result<()> {
        drop(self.input);

        let mut outcome = Ok(());
        for (name, handle) in self.stages {
            let result = handle
                .join()
                .map_err(|_| Error::Inconsistent(format!("TTL {name} stage panicked")))
                .and_then(|result| result);
            if let Err(err) = result {
                // A real failure explains the closed channels of its neighbours.
                let replace = match &outcome {
                    Ok(()) => true,
                    Err(Error::ChannelClosed(_)) => !matches!(err, Error::ChannelClosed(_)),
                    Err(_) => false,
                };
                if replace {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }
}

fn split(
    mut input: Receiver<TtlBlock>,
    txos: Sender<BlockTxos>,
    spends: Sender<BlockSpends>,
) -> Result<()> {
    while let Some(TtlBlock { height, block, undo }) = input.blocking_recv() {
        let skip = dedupe_block(&block);

        let created = block_add_leaf_data(&block, height, &skip.outskip)
            .into_iter()
            .enumerate()
            .map(|(slot, leaf)| CreatedTxo {
                txid: leaf.outpoint.txid,
                vout: leaf.outpoint.vout,
                slot: slot as u32,
            })
            .collect();

        let spent = block_to_del_leaves(&block, &undo, &skip.inskip)?
            .into_iter()
            .map(|leaf| SpentTxo {
                txid: leaf.outpoint.txid,
                vout: leaf.outpoint.vout,
                create_height: leaf.height,
            })
            .collect();

        txos.blocking_send(BlockTxos { height, created })
            .map_err(|_| Error::ChannelClosed("sort-write"))?;
        spends
            .blocking_send(BlockSpends { height, spent })
            .map_err(|_| Error::ChannelClosed("lookup"))?;
    }
    Ok(())
}

fn sort_write(
    mut txos: Receiver<BlockTxos>,
    go: Sender<i32>,
    mut index: TxoIndexWriter,
) -> Result<()> {
    while let Some(BlockTxos { height, created }) = txos.blocking_recv() {
        index.append_block(height, created)?;
        go.blocking_send(height)
            .map_err(|_| Error::ChannelClosed("lookup"))?;
    }
    index.sync()
}

fn lookup(
    mut spends: Receiver<BlockSpends>,
    mut go: Receiver<i32>,
    ttls: Sender<BlockTtls>,
    mut reader: TxoIndexReader,
) -> Result<()> {
    let mut sealed = 0;
    while let Some(BlockSpends { height, spent }) = spends.blocking_recv() {
        while sealed < height {
            sealed = go
                .blocking_recv()
                .ok_or(Error::ChannelClosed("sort-write"))?;
        }

        let results = lookup_spends(&mut reader, height, &spent)?;
        ttls.blocking_send(BlockTtls { height, results })
            .map_err(|_| Error::ChannelClosed("result-writer"))?;
    }
    Ok(())
}

/// Looks up the TTL slots of the outputs spent at `height`, in spending order.
///
/// Spends are grouped by creating block so each block region is read once.
fn lookup_spends(
    reader: &mut TxoIndexReader,
    height: i32,
    spent: &[SpentTxo],
) -> Result<Vec<TtlResult>> {
    let mut by_height: BTreeMap<i32, (Vec<usize>, Vec<(Txid, u32)>)> = BTreeMap::new();
    for (position, txo) in spent.iter().enumerate() {
        if txo.create_height >= height {
            return Err(Error::Inconsistent(format!(
                "block {height} spends {}:{} created at {}",
                txo.txid, txo.vout, txo.create_height
            )));
        }
        let (positions, outputs) = by_height.entry(txo.create_height).or_default();
        positions.push(position);
        outputs.push((txo.txid, txo.vout));
    }

    let mut slots = vec![0u32; spent.len()];
    for (create_height, (positions, outputs)) in by_height {
        let found = reader.lookup_block(create_height, &outputs)?;
        for (position, slot) in positions.into_iter().zip(found) {
            slots[position] = slot;
        }
    }

    Ok(spent
        .iter()
        .zip(slots)
        .map(|(txo, slot)| TtlResult {
            create_height: txo.create_height,
            slot,
        })
        .collect())
}

fn write_results(
    mut ttls: Receiver<BlockTtls>,
    store: Arc<ProofStore>,
    written: &Written,
) -> Result<()> {
    while let Some(BlockTtls { height, results }) = ttls.blocking_recv() {
        for TtlResult { create_height, slot } in results {
            // The creating record may still be on its way to the store.
            if !store.wait_for_height(create_height, None) {
                return Err(Error::ChannelClosed("proof store"));
            }
            store.write_ttl(create_height, slot, height - create_height)?;
        }
        written.advance(height);
        tracing::trace!(height, "Wrote TTLs");
    }
    store.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn txid(tag: u8) -> Txid {
        Txid::from_byte_array([tag; 32])
    }

    fn spend(tag: u8, vout: u32, create_height: i32) -> SpentTxo {
        SpentTxo {
            txid: txid(tag),
            vout,
            create_height,
        }
    }

    #[test]
    fn interleaved_spends_keep_their_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TxoIndexWriter::open(dir.path(), 0).unwrap();
        let block = |tags: &[u8]| -> Vec<CreatedTxo> {
            tags.iter()
                .enumerate()
                .flat_map(|(i, tag)| {
                    (0..2).map(move |vout| CreatedTxo {
                        txid: txid(*tag),
                        vout,
                        slot: 2 * i as u32 + vout,
                    })
                })
                .collect()
        };
        writer.append_block(1, block(&[10, 20, 30])).unwrap();
        writer.append_block(2, block(&[40, 50])).unwrap();

        let mut reader = TxoIndexReader::open(dir.path()).unwrap();
        let spent = vec![
            spend(30, 1, 1),
            spend(50, 0, 2),
            spend(10, 0, 1),
            spend(40, 1, 2),
            spend(20, 1, 1),
        ];
        let results = lookup_spends(&mut reader, 3, &spent).unwrap();
        let expected = [(1, 5), (2, 2), (1, 0), (2, 1), (1, 3)]
            .map(|(create_height, slot)| TtlResult { create_height, slot });
        assert_eq!(results, expected);

        assert!(matches!(
            lookup_spends(&mut reader, 2, &[spend(40, 0, 2)]),
            Err(Error::Inconsistent(_))
        ));
        assert!(matches!(
            lookup_spends(&mut reader, 3, &[spend(10, 0, 1), spend(60, 0, 2)]),
            Err(Error::TxNotFound { height: 2, .. })
        ));
    }
}
