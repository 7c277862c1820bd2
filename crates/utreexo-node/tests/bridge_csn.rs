use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash as _;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Witness,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use utreexo_accumulator::{BackendConfig, Forest, ForestKind, Hash};
use utreexo_network::UBlockServer;
use utreexo_node::bridge::{BridgeConfig, ServeMode};
use utreexo_node::csn::{CompactState, CsnConfig};
use utreexo_node::{BlockSource, DirBlockSource, Error, Paths};
use utreexo_primitives::{
    BlockUndo, SpentOutput, TxUndo, UBlock, block_add_leaf_data, dedupe_block,
};
use utreexo_proof_store::ProofStore;

#[derive(Clone)]
struct Utxo {
    outpoint: OutPoint,
    output: TxOut,
    height: u32,
    is_coinbase: bool,
}

/// Writes a random regtest chain as `<height>.blk` / `<height>.rev` files.
struct ChainBuilder {
    rng: fastrand::Rng,
    tip: BlockHash,
    utxos: Vec<Utxo>,
    /// TTL slot of every accumulated output.
    slots: HashMap<OutPoint, (i32, u32)>,
    /// Expected `(create_height, slot) -> ttl`.
    ttls: HashMap<(i32, u32), i32>,
}

impl ChainBuilder {
    fn new(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
            tip: bitcoin::constants::genesis_block(Network::Regtest).block_hash(),
            utxos: Vec::new(),
            slots: HashMap::new(),
            ttls: HashMap::new(),
        }
    }

    fn script(&mut self) -> ScriptBuf {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend((0..20).map(|_| self.rng.u8(..)));
        ScriptBuf::from_bytes(bytes)
    }

    fn output(&mut self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.rng.u64(1_000..1_000_000)),
            script_pubkey: self.script(),
        }
    }

    fn spend(outpoint: OutPoint) -> TxIn {
        TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }
    }

    fn next_block(&mut self, height: i32) -> (Block, BlockUndo) {
        let mut coinbase_outputs = vec![self.output()];
        if self.rng.bool() {
            coinbase_outputs.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a, 0x01, height as u8]),
            });
        }
        let coinbase = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(height.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: coinbase_outputs,
        };

        let mut txdata = vec![coinbase];
        let mut undo = BlockUndo::default();

        for _ in 0..self.rng.usize(0..4) {
            if self.utxos.is_empty() {
                break;
            }
            let num_inputs = self.rng.usize(1..=2).min(self.utxos.len());
            let spent: Vec<Utxo> = (0..num_inputs)
                .map(|_| {
                    let index = self.rng.usize(..self.utxos.len());
                    self.utxos.swap_remove(index)
                })
                .collect();
            let outputs = (0..self.rng.usize(1..=3)).map(|_| self.output()).collect();
            let tx = Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: spent.iter().map(|utxo| Self::spend(utxo.outpoint)).collect(),
                output: outputs,
            };
            let mut tx_undo = TxUndo::default();
            for utxo in &spent {
                tx_undo.prevouts.push(SpentOutput {
                    height: utxo.height,
                    is_coinbase: utxo.is_coinbase,
                    amount: utxo.output.value,
                    script_pubkey: utxo.output.script_pubkey.clone(),
                });
                if let Some(&(create_height, slot)) = self.slots.get(&utxo.outpoint) {
                    self.ttls.insert((create_height, slot), height - create_height);
                }
            }

            // Spend the first output of the new transaction within the same block.
            if self.rng.u8(..4) == 0 {
                let same_block = OutPoint {
                    txid: tx.compute_txid(),
                    vout: 0,
                };
                let chained = Transaction {
                    version: Version::TWO,
                    lock_time: LockTime::ZERO,
                    input: vec![Self::spend(same_block)],
                    output: vec![self.output()],
                };
                let chained_undo = TxUndo {
                    prevouts: vec![SpentOutput {
                        height: height as u32,
                        is_coinbase: false,
                        amount: tx.output[0].value,
                        script_pubkey: tx.output[0].script_pubkey.clone(),
                    }],
                };
                txdata.push(tx);
                undo.txs.push(tx_undo);
                txdata.push(chained);
                undo.txs.push(chained_undo);
            } else {
                txdata.push(tx);
                undo.txs.push(tx_undo);
            }
        }

        let block = Block {
            header: Header {
                version: BlockVersion::ONE,
                prev_blockhash: self.tip,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000 + height as u32,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: height as u32,
            },
            txdata,
        };

        let skip = dedupe_block(&block);
        let accumulated = block_add_leaf_data(&block, height, &skip.outskip);
        for (slot, leaf) in accumulated.iter().enumerate() {
            self.slots.insert(leaf.outpoint, (height, slot as u32));
            self.utxos.push(Utxo {
                outpoint: leaf.outpoint,
                output: TxOut {
                    value: Amount::from_sat(leaf.amount as u64),
                    script_pubkey: leaf.script_pubkey.clone(),
                },
                height: height as u32,
                is_coinbase: leaf.is_coinbase,
            });
        }

        self.tip = block.block_hash();
        (block, undo)
    }

    /// Writes blocks `0..=tip` into `dir`.
    fn write(&mut self, dir: &Path, tip: i32) {
        let genesis = bitcoin::constants::genesis_block(Network::Regtest);
        std::fs::write(dir.join("0.blk"), serialize(&genesis)).unwrap();
        for height in 1..=tip {
            let (block, undo) = self.next_block(height);
            std::fs::write(dir.join(format!("{height}.blk")), serialize(&block)).unwrap();
            std::fs::write(dir.join(format!("{height}.rev")), serialize(&undo)).unwrap();
        }
    }
}

fn bridge_config(root: &Path, forest: ForestKind, quit_at: Option<i32>) -> BridgeConfig {
    BridgeConfig {
        network: Network::Regtest,
        paths: Paths::new(root),
        forest,
        cow_max_pages: 16,
        quit_at,
        serve: ServeMode::Build,
        listen: "127.0.0.1:0".to_string(),
        follow_tip: false,
        checkpoint_interval: 0,
    }
}

fn csn_config(host: String, quit_after: Option<u32>) -> CsnConfig {
    CsnConfig {
        network: Network::Regtest,
        host,
        watch: None,
        check_signatures: false,
        lookahead: 5,
        quit_after,
    }
}

async fn build(source: &Arc<DirBlockSource>, config: BridgeConfig) -> i32 {
    utreexo_node::bridge::run(config, source.clone(), std::future::pending())
        .await
        .unwrap()
}

fn saved_roots(paths: &Paths, forest: ForestKind) -> (Vec<Hash>, u64, i32) {
    let (mut forest, synced) = Forest::restore(BackendConfig::new(forest, paths.forest_dir())).unwrap();
    (forest.roots().unwrap(), forest.num_leaves(), synced)
}

#[tokio::test(flavor = "multi_thread")]
async fn csn_follows_bridge_to_equal_roots() {
    let blocks = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut chain = ChainBuilder::new(7);
    chain.write(blocks.path(), 40);

    let source = Arc::new(DirBlockSource::open(blocks.path(), Network::Regtest).unwrap());
    assert_eq!(build(&source, bridge_config(data.path(), ForestKind::Ram, None)).await, 40);

    let paths = Paths::new(data.path());
    let (roots, num_leaves, synced) = saved_roots(&paths, ForestKind::Ram);
    assert_eq!(synced, 40);

    let store = Arc::new(ProofStore::open(paths.proof_dir()).unwrap());
    assert_eq!(store.tip(), 40);
    assert!(!chain.ttls.is_empty());
    for (&(height, slot), &ttl) in &chain.ttls {
        assert_eq!(store.get_udata(height).unwrap().txo_ttls[slot as usize], ttl);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(UBlockServer::new(store.clone(), source.clone()).run(listener, async move {
        let _ = stop_rx.await;
    }));

    let state = utreexo_node::csn::run(csn_config(host, None), std::future::pending::<()>())
        .await
        .unwrap();

    assert_eq!(state.height(), 40);
    assert_eq!(state.tip_hash(), source.block(40).unwrap().block_hash());
    assert_eq!(state.pollard().num_leaves(), num_leaves);
    assert_eq!(state.roots().unwrap(), roots);

    let _ = stop_tx.send(());
    store.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_bridge_matches_single_run() {
    let blocks = tempfile::tempdir().unwrap();
    ChainBuilder::new(11).write(blocks.path(), 30);
    let source = Arc::new(DirBlockSource::open(blocks.path(), Network::Regtest).unwrap());

    let resumed = tempfile::tempdir().unwrap();
    assert_eq!(build(&source, bridge_config(resumed.path(), ForestKind::Disk, Some(12))).await, 12);
    assert_eq!(build(&source, bridge_config(resumed.path(), ForestKind::Disk, None)).await, 30);

    let single = tempfile::tempdir().unwrap();
    assert_eq!(build(&source, bridge_config(single.path(), ForestKind::Ram, None)).await, 30);

    let resumed_paths = Paths::new(resumed.path());
    let single_paths = Paths::new(single.path());
    assert_eq!(
        saved_roots(&resumed_paths, ForestKind::Disk),
        saved_roots(&single_paths, ForestKind::Ram)
    );

    let resumed_store = ProofStore::open(resumed_paths.proof_dir()).unwrap();
    let single_store = ProofStore::open(single_paths.proof_dir()).unwrap();
    for height in 1..=30 {
        assert_eq!(
            resumed_store.get_raw(height).unwrap(),
            single_store.get_raw(height).unwrap(),
            "record {height}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_build_resumes_from_last_checkpoint() {
    let blocks = tempfile::tempdir().unwrap();
    ChainBuilder::new(13).write(blocks.path(), 30);
    let source = Arc::new(DirBlockSource::open(blocks.path(), Network::Regtest).unwrap());

    // An unreadable undo file stops the build at #22 without a final save.
    let undo_path = source.undo_path(23);
    let undo = std::fs::read(&undo_path).unwrap();
    std::fs::write(&undo_path, [0xff, 0xff, 0xff]).unwrap();

    let interrupted = tempfile::tempdir().unwrap();
    let paths = Paths::new(interrupted.path());
    let config = || BridgeConfig {
        checkpoint_interval: 10,
        ..bridge_config(interrupted.path(), ForestKind::Cow, None)
    };
    assert!(
        utreexo_node::bridge::run(config(), source.clone(), std::future::pending())
            .await
            .is_err()
    );
    assert_eq!(saved_roots(&paths, ForestKind::Cow).2, 20);
    assert_eq!(ProofStore::open(paths.proof_dir()).unwrap().tip(), 22);

    std::fs::write(&undo_path, undo).unwrap();
    assert_eq!(build(&source, config()).await, 30);

    let single = tempfile::tempdir().unwrap();
    let single_paths = Paths::new(single.path());
    assert_eq!(build(&source, bridge_config(single.path(), ForestKind::Ram, None)).await, 30);
    assert_eq!(
        saved_roots(&paths, ForestKind::Cow),
        saved_roots(&single_paths, ForestKind::Ram)
    );

    let resumed_store = ProofStore::open(paths.proof_dir()).unwrap();
    let single_store = ProofStore::open(single_paths.proof_dir()).unwrap();
    for height in 1..=30 {
        assert_eq!(
            resumed_store.get_raw(height).unwrap(),
            single_store.get_raw(height).unwrap(),
            "record {height}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rebuilding_a_synced_bridge_is_a_no_op() {
    let blocks = tempfile::tempdir().unwrap();
    ChainBuilder::new(3).write(blocks.path(), 8);
    let source = Arc::new(DirBlockSource::open(blocks.path(), Network::Regtest).unwrap());

    let data = tempfile::tempdir().unwrap();
    assert_eq!(build(&source, bridge_config(data.path(), ForestKind::Cow, None)).await, 8);
    let before = saved_roots(&Paths::new(data.path()), ForestKind::Cow);
    assert_eq!(build(&source, bridge_config(data.path(), ForestKind::Cow, None)).await, 8);
    assert_eq!(saved_roots(&Paths::new(data.path()), ForestKind::Cow), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn compact_state_rejects_tampered_proof() {
    let blocks = tempfile::tempdir().unwrap();
    ChainBuilder::new(5).write(blocks.path(), 20);
    let source = Arc::new(DirBlockSource::open(blocks.path(), Network::Regtest).unwrap());

    let data = tempfile::tempdir().unwrap();
    build(&source, bridge_config(data.path(), ForestKind::Ram, None)).await;
    let store = ProofStore::open(Paths::new(data.path()).proof_dir()).unwrap();

    let mut state = CompactState::new(&csn_config(String::new(), None));
    for height in 1..=20 {
        let mut ublock = UBlock {
            block: source.block(height).unwrap(),
            udata: store.get_udata(height).unwrap(),
        };
        if let Some(stxo) = ublock.udata.stxos.first_mut() {
            stxo.amount += 1;
            assert!(matches!(
                state.connect_block(ublock),
                Err(Error::InvalidBlock { height: rejected, .. }) if rejected == height
            ));
            return;
        }
        state.connect_block(ublock).unwrap();
    }
    panic!("chain spends no accumulated output");
}

#[tokio::test(flavor = "multi_thread")]
async fn compact_state_rejects_gap() {
    let blocks = tempfile::tempdir().unwrap();
    ChainBuilder::new(9).write(blocks.path(), 3);
    let source = Arc::new(DirBlockSource::open(blocks.path(), Network::Regtest).unwrap());

    let data = tempfile::tempdir().unwrap();
    build(&source, bridge_config(data.path(), ForestKind::Ram, None)).await;
    let store = ProofStore::open(Paths::new(data.path()).proof_dir()).unwrap();

    let mut state = CompactState::new(&csn_config(String::new(), None));
    let ublock = UBlock {
        block: source.block(2).unwrap(),
        udata: store.get_udata(2).unwrap(),
    };
    assert!(matches!(
        state.connect_block(ublock),
        Err(Error::InvalidBlock { height: 2, .. })
    ));
    assert_eq!(state.height(), 0);
}
