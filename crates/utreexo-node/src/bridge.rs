//! Bridge node: folds every block into the forest, writes its proof record
//! and serves the records to compact state nodes.
//!
//! ```text
//! block reader ──(height, block, undo)──> block processor ──> TTL pipeline
//!                                              │                   │
//!                                              v                   v
//!                                         proof store <────── TTL writes
//! ```
//!
//! The reader and the processor run on blocking threads linked by a bounded
//! queue. The processor owns the forest and handles one block at a time.

use crate::block_index::BlockHashIndex;
use crate::block_source::BlockSource;
use crate::informant::Progress;
use crate::{Error, Paths, Result};
use bitcoin::Block;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use utreexo_accumulator::{BackendConfig, Forest, ForestKind};
use utreexo_network::{BlockProvider, UBlockServer};
use utreexo_primitives::{
    BlockUndo, block_to_add_leaves, block_to_del_leaves, dedupe_block, gen_udata,
};
use utreexo_proof_store::ProofStore;
use utreexo_ttl::{TtlBlock, TtlPipeline};

/// Blocks buffered between the reader and the processor.
const BLOCK_QUEUE_SIZE: usize = 10;

/// Blocks between two saves of the forest while building.
pub const DEFAULT_CHECKPOINT_INTERVAL: i32 = 1000;

/// Whether the bridge builds, serves, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Build up to the available tip, then exit.
    Build,
    /// Build up to the available tip, keep serving until shutdown.
    BuildAndServe,
    /// Serve the existing proof records without building.
    ServeOnly,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub network: bitcoin::Network,
    pub paths: Paths,
    pub forest: ForestKind,
    /// Pages kept in memory by the copy-on-write forest.
    pub cow_max_pages: usize,
    /// Last height to build.
    pub quit_at: Option<i32>,
    pub serve: ServeMode,
    pub listen: String,
    /// Stream blocks built after an open-ended request arrived.
    pub follow_tip: bool,
    /// Save the forest every this many blocks; 0 saves only when building ends.
    pub checkpoint_interval: i32,
}

type QueuedBlock = (i32, Block, BlockUndo);

/// Owner of the forest, applying blocks in height order.
struct BlockProcessor {
    forest: Forest,
    store: Arc<ProofStore>,
    ttl: TtlPipeline,
    hashes: BlockHashIndex,
    height: i32,
    checkpoint_interval: i32,
    progress: Progress,
}

impl BlockProcessor {
    fn process(&mut self, height: i32, block: Block, undo: BlockUndo) -> Result<()> {
        if height != self.height + 1 {
            return Err(Error::Corrupt(format!(
                "block {height} queued after block {}",
                self.height
            )));
        }
        let parent = self.hashes.get(self.height)?;
        if parent != Some(block.header.prev_blockhash) {
            return Err(Error::invalid_block(
                height,
                format!(
                    "parent {} is not block {} ({parent:?})",
                    block.header.prev_blockhash, self.height
                ),
            ));
        }

        let skip = dedupe_block(&block);
        let stxos = block_to_del_leaves(&block, &undo, &skip.inskip)?;
        let adds = block_to_add_leaves(&block, height, &skip.outskip, None);
        let udata = gen_udata(&mut self.forest, height, stxos, adds.len())?;

        let mut dels = udata.acc_proof.targets.clone();
        dels.sort_unstable();
        self.forest.modify(&adds, &dels)?;

        // The record must be durable before the TTL pipeline can fill it in.
        self.store.append(&udata)?;
        self.hashes.push(height, block.block_hash())?;
        self.ttl.send(TtlBlock {
            height,
            block: Arc::new(block),
            undo: Arc::new(undo),
        })?;

        self.height = height;
        self.progress.on_block(height, self.forest.num_leaves());

        if self.checkpoint_interval > 0 && height % self.checkpoint_interval == 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Saves the forest at the current height along with everything a resume
    /// from that height reads back.
    fn checkpoint(&mut self) -> Result<()> {
        self.ttl.checkpoint(self.height)?;
        self.hashes.sync()?;
        self.store.flush()?;
        self.forest.persist(self.height)?;
        tracing::debug!(height = self.height, "Checkpointed forest");
        Ok(())
    }

    fn run(mut self, mut blocks: mpsc::Receiver<QueuedBlock>) -> (Self, Result<()>) {
        while let Some((height, block, undo)) = blocks.blocking_recv() {
            if let Err(err) = self.process(height, block, undo) {
                return (self, Err(err));
            }
        }
        (self, Ok(()))
    }

    /// Drains the TTL pipeline and saves the forest unless building failed.
    fn finish(self, outcome: Result<()>) -> Result<i32> {
        let Self {
            mut forest,
            store,
            ttl,
            hashes,
            height,
            ..
        } = self;

        match (outcome, ttl.finish()) {
            // A processor failing to hand over a block reports the pipeline's own error.
            (Err(Error::Ttl(utreexo_ttl::Error::ChannelClosed(_))), Err(root_cause)) => {
                return Err(root_cause.into());
            }
            (Err(err), _) => return Err(err),
            (Ok(()), Err(err)) => return Err(err.into()),
            (Ok(()), Ok(())) => {}
        }

        hashes.sync()?;
        store.flush()?;
        forest.persist(height)?;
        let num_leaves = forest.num_leaves();
        forest.close()?;

        tracing::info!("💾 Saved forest at #{height} with {num_leaves} leaves");
        Ok(height)
    }
}

fn read_blocks<S: BlockSource>(
    source: &S,
    heights: RangeInclusive<i32>,
    blocks: mpsc::Sender<QueuedBlock>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    for height in heights {
        if *stop.borrow() {
            tracing::info!("Stopped reading blocks before #{height}");
            break;
        }
        let (block, undo) = source.block_and_undo(height)?;
        if blocks.blocking_send((height, block, undo)).is_err() {
            // Processor stopped, it reports why.
            break;
        }
    }
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(err))
}

/// Opens the forest, resuming from the last saved one when present.
fn open_forest(config: &BridgeConfig) -> Result<(Forest, i32)> {
    let backend = BackendConfig {
        cow_max_pages: config.cow_max_pages,
        ..BackendConfig::new(config.forest, config.paths.forest_dir())
    };
    if config.paths.has_forest() {
        Ok(Forest::restore(backend)?)
    } else {
        Ok((Forest::new(backend)?, 0))
    }
}

/// Runs the bridge until the build completes or, when serving, until `shutdown` resolves.
///
/// Returns the height the forest is synced to.
pub async fn run<S>(
    config: BridgeConfig,
    source: Arc<S>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<i32>
where
    S: BlockSource + BlockProvider,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(true);
    });

    config.paths.create_all()?;

    let (forest, synced) = open_forest(&config)?;
    let store = Arc::new(ProofStore::open(config.paths.proof_dir())?);
    let tip = store.tip();
    if tip < synced {
        return Err(Error::Corrupt(format!(
            "proof store ends at #{tip}, forest is synced to #{synced}"
        )));
    }
    if tip > synced {
        tracing::warn!(tip, synced, "Dropping proof records past the saved forest");
        store.truncate(synced)?;
    }

    let mut hashes = BlockHashIndex::open(config.paths.offset_dir(), synced)?;
    let synced_hash = source.block(synced)?.block_hash();
    match hashes.get(synced)? {
        Some(hash) if hash != synced_hash => {
            return Err(Error::Corrupt(format!(
                "block source holds {synced_hash} at #{synced}, the forest was built on {hash}"
            )));
        }
        Some(_) => {}
        None => hashes.push(synced, synced_hash)?,
    }

    tracing::info!(
        network = ?config.network,
        synced,
        leaves = forest.num_leaves(),
        "📦 Bridge data at {}",
        config.paths.root().display()
    );

    let server = if config.serve == ServeMode::Build {
        None
    } else {
        let listener = TcpListener::bind(&config.listen).await?;
        let server = UBlockServer::new(store.clone(), source.clone()).follow_tip(config.follow_tip);
        Some(tokio::spawn(server.run(listener, stopped(stop_rx.clone()))))
    };

    let end = match config.serve {
        ServeMode::ServeOnly => synced,
        _ => source.tip()?.min(config.quit_at.unwrap_or(i32::MAX)),
    };
    let synced = if end > synced {
        tracing::info!("Building blocks #{}..=#{end}", synced + 1);

        let processor = BlockProcessor {
            ttl: TtlPipeline::spawn(&config.paths.ttl_dir(), synced, store.clone())?,
            forest,
            store: store.clone(),
            hashes,
            height: synced,
            checkpoint_interval: config.checkpoint_interval,
            progress: Progress::new("🏗️  Built", synced),
        };

        let (blocks_tx, blocks_rx) = mpsc::channel(BLOCK_QUEUE_SIZE);
        let reader = tokio::task::spawn_blocking({
            let source = source.clone();
            let stop = stop_rx.clone();
            move || read_blocks(&*source, synced + 1..=end, blocks_tx, stop)
        });
        let (processor, built) = tokio::task::spawn_blocking(move || processor.run(blocks_rx))
            .await
            .map_err(join_error)?;
        let read = reader.await.map_err(join_error)?;

        processor.finish(built.and(read))?
    } else {
        if config.serve != ServeMode::ServeOnly {
            tracing::info!("Nothing to build, forest is at #{synced}");
        }
        hashes.sync()?;
        forest.close()?;
        synced
    };

    if let Some(server) = server {
        if !*stop_rx.borrow() {
            tracing::info!("Serving proofs until shutdown");
        }
        stopped(stop_rx).await;
        store.close()?;
        server.await.map_err(join_error)??;
    } else {
        store.close()?;
    }

    Ok(synced)
}
