use crate::{Error, Result};
use bitcoin::consensus::{Params, serialize};
use bitcoin::{Block, Network, OutPoint, TxOut};
use std::collections::HashMap;
use utreexo_primitives::LeafData;

/// Activation heights missing from [`Params`].
struct Deployments {
    csv_height: u32,
    segwit_height: u32,
}

impl Deployments {
    fn new(network: Network) -> Self {
        match network {
            Network::Bitcoin => Self {
                csv_height: 419328,
                segwit_height: 481824,
            },
            Network::Testnet => Self {
                csv_height: 770112,
                segwit_height: 834624,
            },
            Network::Regtest => Self {
                csv_height: 1,
                segwit_height: 0,
            },
            _ => Self {
                csv_height: 1,
                segwit_height: 1,
            },
        }
    }
}

/// Script verification flags enforced at `height`.
fn block_script_flags(height: u32, block_time: u32, network: Network) -> u32 {
    let params = Params::new(network);
    let deployments = Deployments::new(network);

    let mut flags = bitcoinconsensus::VERIFY_NONE;
    if block_time >= params.bip16_time {
        flags |= bitcoinconsensus::VERIFY_P2SH;
    }
    if height >= params.bip66_height {
        flags |= bitcoinconsensus::VERIFY_DERSIG;
    }
    if height >= params.bip65_height {
        flags |= bitcoinconsensus::VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if height >= deployments.csv_height {
        flags |= bitcoinconsensus::VERIFY_CHECKSEQUENCEVERIFY;
    }
    if height >= deployments.segwit_height && flags & bitcoinconsensus::VERIFY_P2SH != 0 {
        flags |= bitcoinconsensus::VERIFY_WITNESS | bitcoinconsensus::VERIFY_NULLDUMMY;
    }
    flags
}

/// Runs every input script of `block` against the output it spends.
///
/// `stxos` are the accumulated outputs spent by the block in input order;
/// inputs listed in `inskip` spend outputs of the block itself.
pub(crate) fn verify_block_scripts(
    block: &Block,
    height: i32,
    stxos: &[LeafData],
    inskip: &[u32],
    network: Network,
) -> Result<()> {
    let flags = block_script_flags(height as u32, block.header.time, network);

    let created: HashMap<OutPoint, &TxOut> = block
        .txdata
        .iter()
        .flat_map(|tx| {
            let txid = tx.compute_txid();
            tx.output.iter().enumerate().map(move |(vout, output)| {
                (
                    OutPoint {
                        txid,
                        vout: vout as u32,
                    },
                    output,
                )
            })
        })
        .collect();

    let mut stxos = stxos.iter();
    let mut inskip = inskip.iter().peekable();
    let mut position = block
        .txdata
        .first()
        .map_or(0, |coinbase| coinbase.input.len() as u32);

    for tx in block.txdata.iter().skip(1) {
        let raw_tx = serialize(tx);
        for (input_index, input) in tx.input.iter().enumerate() {
            let input_position = position;
            position += 1;

            let (script_pubkey, amount) = if inskip.next_if_eq(&&input_position).is_some() {
                let output = created.get(&input.previous_output).ok_or_else(|| {
                    Error::invalid_block(height, format!("{} not created in block", input.previous_output))
                })?;
                (output.script_pubkey.as_bytes(), output.value.to_sat())
            } else {
                let leaf = stxos.next().ok_or_else(|| {
                    Error::invalid_block(height, "fewer spent outputs than inputs")
                })?;
                (leaf.script_pubkey.as_bytes(), leaf.amount as u64)
            };

            bitcoinconsensus::verify_with_flags(script_pubkey, amount, &raw_tx, input_index, flags)
                .map_err(|err| {
                    Error::invalid_block(
                        height,
                        format!("input {input_index} of {}: {err:?}", tx.compute_txid()),
                    )
                })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_activation_heights() {
        let early = block_script_flags(1, 1_231_006_505, Network::Bitcoin);
        assert_eq!(early, bitcoinconsensus::VERIFY_NONE);

        let segwit = block_script_flags(481_824, 1_503_539_857, Network::Bitcoin);
        assert_ne!(segwit & bitcoinconsensus::VERIFY_WITNESS, 0);
        assert_ne!(segwit & bitcoinconsensus::VERIFY_P2SH, 0);
        assert_ne!(segwit & bitcoinconsensus::VERIFY_CHECKSEQUENCEVERIFY, 0);

        let regtest = block_script_flags(1, 1_700_000_000, Network::Regtest);
        assert_ne!(regtest & bitcoinconsensus::VERIFY_WITNESS, 0);
    }

    #[test]
    fn coinbase_only_block_passes() {
        let block = bitcoin::constants::genesis_block(Network::Regtest);
        verify_block_scripts(&block, 0, &[], &[], Network::Regtest).unwrap();
    }
}
