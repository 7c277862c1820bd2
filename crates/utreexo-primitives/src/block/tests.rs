use super::*;
use crate::undo::{SpentOutput, TxUndo};
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, BlockHash, CompactTarget, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};
use utreexo_accumulator::{BackendConfig, ForestKind};

fn script(tag: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([tag; 20]))
}

fn tx(inputs: &[OutPoint], num_outputs: usize, tag: u8) -> Transaction {
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|previous_output| TxIn {
                previous_output: *previous_output,
                script_sig: ScriptBuf::from_bytes(vec![tag]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: (0..num_outputs)
            .map(|i| TxOut {
                value: Amount::from_sat(1000 * (i as u64 + 1)),
                script_pubkey: script(tag),
            })
            .collect(),
    }
}

fn block(txdata: Vec<Transaction>) -> Block {
    Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        },
        txdata,
    }
}

fn spent(height: u32, amount: u64, tag: u8) -> SpentOutput {
    SpentOutput {
        height,
        is_coinbase: false,
        amount: Amount::from_sat(amount),
        script_pubkey: script(tag),
    }
}

fn external(i: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([i; 32]),
        vout: 0,
    }
}

#[test]
fn same_block_spend_is_skipped() {
    let coinbase = tx(&[OutPoint::null()], 1, 100);
    let t1 = tx(&[external(1)], 5, 1);
    let t1_id = t1.compute_txid();
    let t2 = tx(&[OutPoint { txid: t1_id, vout: 2 }], 2, 2);
    let block = block(vec![coinbase, t1, t2]);

    let skip = dedupe_block(&block);
    // Inputs: coinbase 0, t1 1, t2 2. Outputs: coinbase 0, t1 1..=5, t2 6..=7.
    assert_eq!(skip.inskip, vec![2]);
    assert_eq!(skip.outskip, vec![3]);

    let adds = block_add_leaf_data(&block, 100, &skip.outskip);
    let created: Vec<(Txid, u32)> = adds.iter().map(|l| (l.outpoint.txid, l.outpoint.vout)).collect();
    assert_eq!(adds.len(), 1 + 4 + 2);
    assert!(adds[0].is_coinbase);
    assert!(!created.contains(&(t1_id, 2)));
    for vout in [0, 1, 3, 4] {
        assert!(created.contains(&(t1_id, vout)));
    }

    let undo = BlockUndo {
        txs: vec![
            TxUndo {
                prevouts: vec![spent(7, 5000, 9)],
            },
            TxUndo {
                prevouts: vec![spent(100, 3000, 1)],
            },
        ],
    };
    let dels = block_to_del_leaves(&block, &undo, &skip.inskip).unwrap();
    assert_eq!(dels.len(), 1);
    assert_eq!(dels[0].outpoint, external(1));
    assert_eq!(dels[0].height, 7);
    assert_eq!(dels[0].amount, 5000);
}

#[test]
fn unspendable_outputs_take_no_slot() {
    let mut coinbase = tx(&[OutPoint::null()], 2, 100);
    coinbase.output[0].script_pubkey = ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x00]);
    let block = block(vec![coinbase]);

    let adds = block_to_add_leaves(&block, 5, &[], Some(&[true][..]));
    assert_eq!(adds.len(), 1);
    assert!(adds[0].remember);

    let leaves = block_add_leaf_data(&block, 5, &[]);
    assert_eq!(leaves[0].outpoint.vout, 1);
    assert_eq!(adds[0].hash, leaves[0].leaf_hash());
}

#[test]
fn undo_must_cover_every_input() {
    let block = block(vec![
        tx(&[OutPoint::null()], 1, 100),
        tx(&[external(1), external(2)], 1, 1),
    ]);
    let undo = BlockUndo {
        txs: vec![TxUndo {
            prevouts: vec![spent(1, 10, 1)],
        }],
    };
    assert!(matches!(
        block_to_del_leaves(&block, &undo, &[]),
        Err(Error::Inconsistent(_))
    ));
    assert!(matches!(
        block_to_del_leaves(&block, &BlockUndo::default(), &[]),
        Err(Error::Inconsistent(_))
    ));
}

#[test]
fn proof_record_verifies_against_forest() {
    let dir = tempfile::tempdir().unwrap();
    let mut forest = Forest::new(BackendConfig::new(ForestKind::Ram, dir.path())).unwrap();

    let first = block(vec![tx(&[OutPoint::null()], 1, 100), tx(&[external(1)], 6, 1)]);
    let skip = dedupe_block(&first);
    let adds = block_to_add_leaves(&first, 1, &skip.outskip, None);
    forest.modify(&adds, &[]).unwrap();

    let t1_id = first.txdata[1].compute_txid();
    let second = block(vec![
        tx(&[OutPoint::null()], 1, 101),
        tx(
            &[OutPoint { txid: t1_id, vout: 4 }, OutPoint { txid: t1_id, vout: 1 }],
            1,
            2,
        ),
    ]);
    let undo = BlockUndo {
        txs: vec![TxUndo {
            prevouts: vec![
                spent(1, 5000, 1),
                spent(1, 2000, 1),
            ],
        }],
    };
    let skip = dedupe_block(&second);
    let stxos = block_to_del_leaves(&second, &undo, &skip.inskip).unwrap();
    let udata = gen_udata(&mut forest, 2, stxos, 2).unwrap();

    assert_eq!(udata.acc_proof.targets, vec![5, 2]);
    assert_eq!(udata.txo_ttls, vec![0, 0]);
    let roots = forest.roots().unwrap();
    udata.verify(&roots, forest.num_leaves(), forest.rows()).unwrap();

    // A tampered preimage no longer matches the accumulator.
    let mut tampered = udata.clone();
    tampered.stxos[0].amount += 1;
    assert!(tampered.verify(&roots, forest.num_leaves(), forest.rows()).is_err());

    // Spending an output that was never added cannot be proven.
    let bogus = vec![LeafData::new(external(9), 1, false, 1, script(9))];
    assert!(gen_udata(&mut forest, 2, bogus, 0).is_err());
}
