//! Compact state node: validates blocks against a pollard fed by the proofs
//! a bridge streams along with every block.

use crate::informant::Progress;
use crate::{Error, Result};
use bitcoin::{Block, BlockHash, Network, ScriptBuf};
use std::future::Future;
use utreexo_accumulator::{Hash, Pollard};
use utreexo_network::{UBlockClient, UP_TO_TIP};
use utreexo_primitives::{
    LeafData, UBlock, UData, block_add_leaf_data, block_to_add_leaves, dedupe_block,
};

#[derive(Debug, Clone)]
pub struct CsnConfig {
    pub network: Network,
    /// Bridge address.
    pub host: String,
    /// Outputs locked to this script are remembered and reported.
    pub watch: Option<ScriptBuf>,
    /// Run input scripts through the consensus library.
    pub check_signatures: bool,
    /// Remember new outputs spent within this many blocks.
    pub lookahead: i32,
    /// Stop once this many blocks are validated.
    pub quit_after: Option<u32>,
}

/// Accumulator state of a compact state node.
pub struct CompactState {
    pollard: Pollard,
    height: i32,
    tip_hash: BlockHash,
    network: Network,
    lookahead: i32,
    watch: Option<ScriptBuf>,
    check_signatures: bool,
}

impl CompactState {
    /// Empty state sitting at the genesis block of `config.network`.
    pub fn new(config: &CsnConfig) -> Self {
        Self {
            pollard: Pollard::new(),
            height: 0,
            tip_hash: bitcoin::constants::genesis_block(config.network).block_hash(),
            network: config.network,
            lookahead: config.lookahead,
            watch: config.watch.clone(),
            check_signatures: config.check_signatures,
        }
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.tip_hash
    }

    pub fn pollard(&self) -> &Pollard {
        &self.pollard
    }

    /// Accumulator roots, highest row first.
    pub fn roots(&self) -> Result<Vec<Hash>> {
        Ok(self.pollard.roots()?)
    }

    fn is_watched(&self, script_pubkey: &ScriptBuf) -> bool {
        self.watch.as_ref() == Some(script_pubkey)
    }

    /// Validates the next block with its proof and applies it to the pollard.
    pub fn connect_block(&mut self, ublock: UBlock) -> Result<()> {
        let UBlock { block, udata } = ublock;
        let height = self.height + 1;

        if udata.height != height {
            return Err(Error::invalid_block(
                udata.height,
                format!("received while expecting #{height}"),
            ));
        }
        if block.header.prev_blockhash != self.tip_hash {
            return Err(Error::invalid_block(
                height,
                format!("parent {} is not the tip {}", block.header.prev_blockhash, self.tip_hash),
            ));
        }

        let skip = dedupe_block(&block);
        check_spent_outpoints(&block, &udata, &skip.inskip)?;

        self.pollard
            .ingest_batch_proof(&udata.leaf_hashes(), &udata.acc_proof)
            .map_err(|err| Error::invalid_block(height, err))?;

        if self.check_signatures {
            self.verify_scripts(&block, &udata, &skip.inskip)?;
        }

        for spent in udata.stxos.iter().filter(|leaf| self.is_watched(&leaf.script_pubkey)) {
            tracing::info!(
                "👀 Watched output {} of {} sats spent in #{height}",
                spent.outpoint,
                spent.amount
            );
        }

        let created = block_add_leaf_data(&block, height, &skip.outskip);
        if created.len() != udata.txo_ttls.len() {
            return Err(Error::invalid_block(
                height,
                format!(
                    "{} TTLs for {} new outputs",
                    udata.txo_ttls.len(),
                    created.len()
                ),
            ));
        }
        let remember: Vec<bool> = created
            .iter()
            .zip(&udata.txo_ttls)
            .map(|(leaf, &ttl)| self.should_remember(leaf, ttl, height))
            .collect();
        let adds = block_to_add_leaves(&block, height, &skip.outskip, Some(remember.as_slice()));

        let mut dels = udata.acc_proof.targets.clone();
        dels.sort_unstable();
        self.pollard.modify(&adds, &dels)?;

        self.height = height;
        self.tip_hash = block.block_hash();

        tracing::trace!(
            height,
            leaves = self.pollard.num_leaves(),
            resident = self.pollard.resident(),
            "Connected block"
        );

        Ok(())
    }

    fn should_remember(&self, leaf: &LeafData, ttl: i32, height: i32) -> bool {
        if self.is_watched(&leaf.script_pubkey) {
            tracing::info!(
                "👀 Watched output {} of {} sats created in #{height}",
                leaf.outpoint,
                leaf.amount
            );
            return true;
        }
        ttl > 0 && ttl <= self.lookahead
    }

    #[cfg(feature = "checksig")]
    fn verify_scripts(&self, block: &Block, udata: &UData, inskip: &[u32]) -> Result<()> {
        crate::script::verify_block_scripts(block, udata.height, &udata.stxos, inskip, self.network)
    }

    #[cfg(not(feature = "checksig"))]
    fn verify_scripts(&self, _block: &Block, _udata: &UData, _inskip: &[u32]) -> Result<()> {
        Err(Error::Config(format!(
            "script checks on {:?} need the `checksig` feature",
            self.network
        )))
    }
}

/// Checks that the proof record covers exactly the inputs of `block` that
/// spend accumulated outputs, in input order.
fn check_spent_outpoints(block: &Block, udata: &UData, inskip: &[u32]) -> Result<()> {
    let height = udata.height;
    let mut inskip = inskip.iter().peekable();
    let mut stxos = udata.stxos.iter();
    let mut position = block
        .txdata
        .first()
        .map_or(0, |coinbase| coinbase.input.len() as u32);

    for tx in block.txdata.iter().skip(1) {
        for input in &tx.input {
            let input_position = position;
            position += 1;
            if inskip.next_if_eq(&&input_position).is_some() {
                continue;
            }
            match stxos.next() {
                Some(leaf) if leaf.outpoint == input.previous_output => {}
                Some(leaf) => {
                    return Err(Error::invalid_block(
                        height,
                        format!(
                            "proof covers {} where input spends {}",
                            leaf.outpoint, input.previous_output
                        ),
                    ));
                }
                None => {
                    return Err(Error::invalid_block(
                        height,
                        format!("no proof for input spending {}", input.previous_output),
                    ));
                }
            }
        }
    }

    if stxos.next().is_some() {
        return Err(Error::invalid_block(height, "proof covers outputs no input spends"));
    }
    Ok(())
}

/// Validates the blocks served by the bridge at `config.host`.
///
/// Stops when the bridge closes the stream, when `shutdown` resolves or once
/// `config.quit_after` blocks are validated. A bridge closes the stream at its
/// tip unless it runs with `--followtip`.
pub async fn run(config: CsnConfig, shutdown: impl Future<Output = ()>) -> Result<CompactState> {
    if config.check_signatures && cfg!(not(feature = "checksig")) {
        return Err(Error::Config(
            "--checksig=true needs a build with the `checksig` feature".to_string(),
        ));
    }

    let mut state = CompactState::new(&config);
    let mut client = UBlockClient::connect(&config.host, state.height + 1, UP_TO_TIP).await?;
    tracing::info!(network = ?config.network, "🔗 Connected to bridge at {}", config.host);

    let mut progress = Progress::new("✅ Validated", state.height);
    tokio::pin!(shutdown);

    loop {
        if let Some(limit) = config.quit_after {
            if state.height >= limit as i32 {
                tracing::info!("Validated {limit} blocks, stopping");
                break;
            }
        }

        let ublock = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Stopping at #{}", state.height);
                break;
            }
            next = client.next_ublock() => match next? {
                Some(ublock) => ublock,
                None => {
                    tracing::info!("Bridge closed the stream at #{}", state.height);
                    break;
                }
            },
        };

        state.connect_block(ublock)?;
        progress.on_block(state.height, state.pollard.num_leaves());
    }

    tracing::info!(
        height = %state.height,
        tip = %state.tip_hash,
        leaves = state.pollard.num_leaves(),
        resident = state.pollard.resident(),
        "Compact state"
    );

    Ok(state)
}
