use crate::leaf::LeafData;
use crate::{Error, Result};
use bitcoin::Block;
use bitcoin::consensus::encode::{self, Decodable, Encodable, VarInt};
use utreexo_accumulator::{BatchProof, Hash};

/// Byte offset of the first TTL slot within a serialized [`UData`].
pub const TTL_OFFSET: u64 = 8;

/// Bytes taken by a single TTL slot.
pub const TTL_SLOT_SIZE: u64 = 4;

/// Upper bound on preallocated entries while decoding untrusted counts.
const MAX_PREALLOC: usize = 4096;

/// Proof bundle of one block: the inclusion proof of every output it spends,
/// their preimages and the lifetime of every output it creates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UData {
    pub height: i32,
    pub acc_proof: BatchProof,
    /// One per proof target, in target order.
    pub stxos: Vec<LeafData>,
    /// Blocks until each accumulated output of this block is spent, 0 while unspent.
    pub txo_ttls: Vec<i32>,
}

impl UData {
    /// Builds the proof record of a block creating `num_ttls` accumulated outputs.
    pub fn new(height: i32, acc_proof: BatchProof, stxos: Vec<LeafData>, num_ttls: usize) -> Self {
        Self {
            height,
            acc_proof,
            stxos,
            txo_ttls: vec![0; num_ttls],
        }
    }

    pub fn leaf_hashes(&self) -> Vec<Hash> {
        self.stxos.iter().map(LeafData::leaf_hash).collect()
    }

    /// Offset of TTL slot `k` from the start of the serialized record.
    pub fn ttl_slot_offset(k: u32) -> u64 {
        TTL_OFFSET + TTL_SLOT_SIZE * u64::from(k)
    }

    /// Checks the spent outputs against accumulator roots, highest row first.
    pub fn verify(&self, roots: &[Hash], num_leaves: u64, forest_rows: u8) -> Result<()> {
        if self.stxos.len() != self.acc_proof.targets.len() {
            return Err(Error::Inconsistent(format!(
                "block {}: {} targets but {} spent outputs",
                self.height,
                self.acc_proof.targets.len(),
                self.stxos.len()
            )));
        }
        utreexo_accumulator::verify(
            &self.acc_proof,
            &self.leaf_hashes(),
            roots,
            num_leaves,
            forest_rows,
        )?;
        Ok(())
    }
}

impl Encodable for UData {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> std::result::Result<usize, bitcoin::io::Error> {
        if self.stxos.len() != self.acc_proof.targets.len() {
            return Err(bitcoin::io::Error::new(
                bitcoin::io::ErrorKind::InvalidInput,
                "spent outputs do not match proof targets",
            ));
        }

        let mut len = 0;
        writer.write_all(&self.height.to_be_bytes())?;
        writer.write_all(&(self.txo_ttls.len() as u32).to_be_bytes())?;
        len += 8;
        for ttl in &self.txo_ttls {
            writer.write_all(&ttl.to_be_bytes())?;
            len += 4;
        }

        len += VarInt(self.acc_proof.targets.len() as u64).consensus_encode(writer)?;
        for target in &self.acc_proof.targets {
            writer.write_all(&target.to_be_bytes())?;
            len += 8;
        }
        len += VarInt(self.acc_proof.proof.len() as u64).consensus_encode(writer)?;
        for hash in &self.acc_proof.proof {
            writer.write_all(hash.as_bytes())?;
            len += 32;
        }

        for stxo in &self.stxos {
            len += stxo.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

fn read_array<const N: usize, R: bitcoin::io::Read + ?Sized>(
    reader: &mut R,
) -> std::result::Result<[u8; N], encode::Error> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

impl Decodable for UData {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        let height = i32::from_be_bytes(read_array(reader)?);
        let num_ttls = u32::from_be_bytes(read_array(reader)?) as usize;
        let mut txo_ttls = Vec::with_capacity(num_ttls.min(MAX_PREALLOC));
        for _ in 0..num_ttls {
            txo_ttls.push(i32::from_be_bytes(read_array(reader)?));
        }

        let num_targets = VarInt::consensus_decode(reader)?.0 as usize;
        let mut targets = Vec::with_capacity(num_targets.min(MAX_PREALLOC));
        for _ in 0..num_targets {
            targets.push(u64::from_be_bytes(read_array(reader)?));
        }
        let num_hashes = VarInt::consensus_decode(reader)?.0 as usize;
        let mut proof = Vec::with_capacity(num_hashes.min(MAX_PREALLOC));
        for _ in 0..num_hashes {
            proof.push(Hash(read_array(reader)?));
        }

        let mut stxos = Vec::with_capacity(num_targets.min(MAX_PREALLOC));
        for _ in 0..num_targets {
            stxos.push(LeafData::consensus_decode(reader)?);
        }

        Ok(Self {
            height,
            acc_proof: BatchProof { targets, proof },
            stxos,
            txo_ttls,
        })
    }
}

/// A block followed by its proof bundle, as streamed to compact state nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct UBlock {
    pub block: Block,
    pub udata: UData,
}

impl Encodable for UBlock {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> std::result::Result<usize, bitcoin::io::Error> {
        Ok(self.block.consensus_encode(writer)? + self.udata.consensus_encode(writer)?)
    }
}

impl Decodable for UBlock {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        Ok(Self {
            block: Block::consensus_decode(reader)?,
            udata: UData::consensus_decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;
    use bitcoin::{OutPoint, ScriptBuf, Txid};

    fn stxo(i: u8) -> LeafData {
        LeafData::new(
            OutPoint {
                txid: Txid::from_byte_array([i; 32]),
                vout: u32::from(i),
            },
            i32::from(i) * 10,
            i == 0,
            1000 + i64::from(i),
            ScriptBuf::from_bytes(vec![0x51; usize::from(i)]),
        )
    }

    fn sample() -> UData {
        UData {
            height: 42,
            acc_proof: BatchProof {
                targets: vec![7, 2],
                proof: vec![Hash([5; 32]), Hash([6; 32]), Hash([7; 32])],
            },
            stxos: vec![stxo(1), stxo(2)],
            txo_ttls: vec![0, 3, 0],
        }
    }

    #[test]
    fn layout() {
        let bytes = bitcoin::consensus::serialize(&sample());
        assert_eq!(&bytes[0..4], &42i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_be_bytes());
        let slot = UData::ttl_slot_offset(1) as usize;
        assert_eq!(&bytes[slot..slot + 4], &3i32.to_be_bytes());
        // Compact size target count, then the big-endian targets.
        assert_eq!(bytes[20], 2);
        assert_eq!(&bytes[21..29], &7u64.to_be_bytes());
        assert_eq!(bytes[37], 3);

        let decoded: UData = bitcoin::consensus::deserialize(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = bitcoin::consensus::serialize(&sample());
        for cut in [3, 10, 30, bytes.len() - 1] {
            assert!(bitcoin::consensus::deserialize::<UData>(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn mismatched_stxos_do_not_encode() {
        let mut udata = sample();
        udata.stxos.pop();
        let mut sink = Vec::new();
        assert!(udata.consensus_encode(&mut sink).is_err());
        assert!(matches!(
            udata.verify(&[], 0, 0),
            Err(Error::Inconsistent(_))
        ));
    }

    #[test]
    fn ublock_is_self_delimiting() {
        let block = bitcoin::constants::genesis_block(bitcoin::Network::Regtest);
        let ublocks = [
            UBlock {
                block: block.clone(),
                udata: sample(),
            },
            UBlock {
                block,
                udata: UData::new(1, BatchProof::default(), Vec::new(), 1),
            },
        ];

        let mut stream = Vec::new();
        for ublock in &ublocks {
            ublock.consensus_encode(&mut stream).unwrap();
        }

        let mut reader = stream.as_slice();
        for ublock in &ublocks {
            assert_eq!(&UBlock::consensus_decode(&mut reader).unwrap(), ublock);
        }
        assert!(reader.is_empty());
    }
}
