//! Turns a block and its undo record into accumulator additions and deletions.
//!
//! Inputs and outputs are numbered across the whole block in transaction
//! order, coinbase included. An output spent within its own block never
//! enters the accumulator: both the output and the spending input are skipped.

use crate::leaf::LeafData;
use crate::udata::UData;
use crate::undo::BlockUndo;
use crate::{Error, Result};
use bitcoin::{Block, OutPoint};
use std::collections::HashMap;
use utreexo_accumulator::{Forest, Leaf};

/// Same-block spends: positions of the skipped inputs and outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipLists {
    /// Ascending input positions.
    pub inskip: Vec<u32>,
    /// Ascending output positions.
    pub outskip: Vec<u32>,
}

/// Finds the outputs created and consumed within `block`.
pub fn dedupe_block(block: &Block) -> SkipLists {
    let mut spent_in_block: HashMap<OutPoint, u32> = HashMap::new();
    let mut input_position = 0u32;
    for (tx_index, tx) in block.txdata.iter().enumerate() {
        for input in &tx.input {
            if tx_index > 0 {
                spent_in_block.insert(input.previous_output, input_position);
            }
            input_position += 1;
        }
    }

    let mut skip = SkipLists::default();
    let mut output_position = 0u32;
    for tx in &block.txdata {
        let txid = tx.compute_txid();
        for vout in 0..tx.output.len() as u32 {
            if let Some(&input_position) = spent_in_block.get(&OutPoint { txid, vout }) {
                skip.inskip.push(input_position);
                skip.outskip.push(output_position);
            }
            output_position += 1;
        }
    }
    skip.inskip.sort_unstable();
    skip
}

/// Preimages of the outputs of `block` entering the accumulator, in TTL slot order.
pub fn block_add_leaf_data(block: &Block, height: i32, outskip: &[u32]) -> Vec<LeafData> {
    let mut outskip = outskip.iter().peekable();
    let mut leaves = Vec::new();
    let mut output_position = 0u32;
    for (tx_index, tx) in block.txdata.iter().enumerate() {
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            let position = output_position;
            output_position += 1;

            if outskip.next_if_eq(&&position).is_some() {
                continue;
            }
            let leaf = LeafData::new(
                OutPoint {
                    txid,
                    vout: vout as u32,
                },
                height,
                tx_index == 0,
                output.value.to_sat() as i64,
                output.script_pubkey.clone(),
            );
            if leaf.is_unspendable() {
                continue;
            }
            leaves.push(leaf);
        }
    }
    leaves
}

/// Leaves added by `block`; `remember[k]` flags the k-th one for caching.
pub fn block_to_add_leaves(
    block: &Block,
    height: i32,
    outskip: &[u32],
    remember: Option<&[bool]>,
) -> Vec<Leaf> {
    block_add_leaf_data(block, height, outskip)
        .iter()
        .enumerate()
        .map(|(k, leaf)| {
            let remember = remember
                .and_then(|flags| flags.get(k).copied())
                .unwrap_or(false);
            Leaf::new(leaf.leaf_hash(), remember)
        })
        .collect()
}

/// Preimages of the accumulated outputs spent by `block`, in input order.
pub fn block_to_del_leaves(block: &Block, undo: &BlockUndo, inskip: &[u32]) -> Result<Vec<LeafData>> {
    let spending_txs = block.txdata.len().saturating_sub(1);
    if undo.txs.len() != spending_txs {
        return Err(Error::Inconsistent(format!(
            "undo data covers {} transactions, block has {spending_txs}",
            undo.txs.len()
        )));
    }

    let mut inskip = inskip.iter().peekable();
    let mut leaves = Vec::new();
    let mut input_position = block.txdata.first().map_or(0, |coinbase| coinbase.input.len() as u32);

    for (tx, tx_undo) in block.txdata.iter().skip(1).zip(&undo.txs) {
        if tx.input.len() != tx_undo.prevouts.len() {
            return Err(Error::Inconsistent(format!(
                "tx {} has {} inputs but {} undo entries",
                tx.compute_txid(),
                tx.input.len(),
                tx_undo.prevouts.len()
            )));
        }
        for (input, spent) in tx.input.iter().zip(&tx_undo.prevouts) {
            let position = input_position;
            input_position += 1;

            if inskip.next_if_eq(&&position).is_some() {
                continue;
            }
            let height = i32::try_from(spent.height)
                .map_err(|_| Error::malformed(format!("undo height {}", spent.height)))?;
            let leaf = LeafData::new(
                input.previous_output,
                height,
                spent.is_coinbase,
                spent.amount.to_sat() as i64,
                spent.script_pubkey.clone(),
            );
            if leaf.is_unspendable() {
                return Err(Error::Inconsistent(format!(
                    "input {} spends an unspendable output",
                    input.previous_output
                )));
            }
            leaves.push(leaf);
        }
    }
    Ok(leaves)
}

/// Proves the outputs spent at `height` and wraps them in a fresh proof record.
pub fn gen_udata(forest: &mut Forest, height: i32, stxos: Vec<LeafData>, num_ttls: usize) -> Result<UData> {
    let del_hashes: Vec<_> = stxos.iter().map(LeafData::leaf_hash).collect();
    let acc_proof = forest.prove_batch(&del_hashes)?;
    if acc_proof.targets.len() != stxos.len() {
        return Err(Error::Inconsistent(format!(
            "block {height}: {} targets for {} spent outputs",
            acc_proof.targets.len(),
            stxos.len()
        )));
    }
    tracing::trace!(
        height,
        targets = acc_proof.targets.len(),
        proof_hashes = acc_proof.proof.len(),
        "Generated proof record"
    );
    Ok(UData::new(height, acc_proof, stxos, num_ttls))
}

#[cfg(test)]
mod tests;
