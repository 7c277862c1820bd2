use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, OutPoint, ScriptBuf, Txid};
use utreexo_accumulator::Hash;

/// Largest locking script committed to the accumulator.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Bytes of a serialized [`LeafData`] before the locking script.
pub const LEAF_DATA_HEADER_SIZE: usize = 82;

const OP_RETURN: u8 = 0x6a;

/// Preimage of a leaf hash: everything needed to check a spend of the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafData {
    /// Header hash of the creating block, all zero in compact form.
    pub block_hash: BlockHash,
    pub outpoint: OutPoint,
    pub height: i32,
    pub is_coinbase: bool,
    /// Satoshis.
    pub amount: i64,
    pub script_pubkey: ScriptBuf,
}

impl LeafData {
    /// Builds the compact form, with a zero block hash.
    pub fn new(
        outpoint: OutPoint,
        height: i32,
        is_coinbase: bool,
        amount: i64,
        script_pubkey: ScriptBuf,
    ) -> Self {
        Self {
            block_hash: BlockHash::all_zeros(),
            outpoint,
            height,
            is_coinbase,
            amount,
            script_pubkey,
        }
    }

    /// Big-endian fixed-field encoding the leaf hash commits to.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(LEAF_DATA_HEADER_SIZE + self.script_pubkey.len());
        data.extend_from_slice(&self.block_hash.to_byte_array());
        data.extend_from_slice(&self.outpoint.txid.to_byte_array());
        data.extend_from_slice(&self.outpoint.vout.to_be_bytes());
        data.extend_from_slice(&(((self.height as u32) << 1) | self.is_coinbase as u32).to_be_bytes());
        data.extend_from_slice(&self.amount.to_be_bytes());
        data.extend_from_slice(&(self.script_pubkey.len() as u16).to_be_bytes());
        data.extend_from_slice(self.script_pubkey.as_bytes());
        data
    }

    /// SHA-512/256 of [`LeafData::to_bytes`].
    pub fn leaf_hash(&self) -> Hash {
        Hash::digest(&self.to_bytes())
    }

    pub fn is_unspendable(&self) -> bool {
        is_unspendable(self.script_pubkey.as_bytes())
    }
}

/// Outputs that can never be spent are kept out of the accumulator.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) || script.len() > MAX_SCRIPT_SIZE
}

impl Encodable for LeafData {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        if self.script_pubkey.len() > MAX_SCRIPT_SIZE {
            return Err(bitcoin::io::Error::new(
                bitcoin::io::ErrorKind::InvalidInput,
                "script exceeds the leaf data limit",
            ));
        }
        let data = self.to_bytes();
        writer.write_all(&data)?;
        Ok(data.len())
    }
}

impl Decodable for LeafData {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let mut header = [0u8; LEAF_DATA_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let mut block_hash = [0u8; 32];
        block_hash.copy_from_slice(&header[0..32]);
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&header[32..64]);
        let be_u32 = |at: usize| u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        let vout = be_u32(64);
        let code = be_u32(68);
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&header[72..80]);
        let script_len = u16::from_be_bytes([header[80], header[81]]) as usize;

        if script_len > MAX_SCRIPT_SIZE {
            return Err(encode::Error::ParseFailed("leaf data script too long"));
        }
        let mut script = vec![0u8; script_len];
        reader.read_exact(&mut script)?;

        Ok(Self {
            block_hash: BlockHash::from_byte_array(block_hash),
            outpoint: OutPoint {
                txid: Txid::from_byte_array(txid),
                vout,
            },
            height: (code >> 1) as i32,
            is_coinbase: code & 1 == 1,
            amount: i64::from_be_bytes(amount),
            script_pubkey: ScriptBuf::from_bytes(script),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LeafData {
        LeafData::new(
            OutPoint {
                txid: Txid::from_byte_array([7u8; 32]),
                vout: 3,
            },
            100,
            true,
            50_0000_0000,
            ScriptBuf::from_bytes(hex::decode("76a914000102030405060708090a0b0c0d0e0f1011121388ac").unwrap()),
        )
    }

    #[test]
    fn layout_is_big_endian() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), LEAF_DATA_HEADER_SIZE + 25);
        assert_eq!(&bytes[0..32], &[0u8; 32]);
        assert_eq!(&bytes[32..64], &[7u8; 32]);
        assert_eq!(&bytes[64..68], &[0, 0, 0, 3]);
        // (100 << 1) | 1
        assert_eq!(&bytes[68..72], &[0, 0, 0, 201]);
        assert_eq!(&bytes[72..80], &5_000_000_000i64.to_be_bytes());
        assert_eq!(&bytes[80..82], &[0, 25]);
    }

    #[test]
    fn decode_matches_encode() {
        let leaf = sample();
        let bytes = bitcoin::consensus::serialize(&leaf);
        let decoded: LeafData = bitcoin::consensus::deserialize(&bytes).unwrap();
        assert_eq!(decoded, leaf);
        assert_eq!(decoded.leaf_hash(), Hash::digest(&bytes));
    }

    #[test]
    fn oversized_script_is_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[80..82].copy_from_slice(&10_001u16.to_be_bytes());
        assert!(bitcoin::consensus::deserialize::<LeafData>(&bytes).is_err());
    }

    #[test]
    fn unspendable_outputs() {
        assert!(is_unspendable(&[0x6a, 0x04, 1, 2, 3, 4]));
        assert!(is_unspendable(&vec![0x51; MAX_SCRIPT_SIZE + 1]));
        assert!(!is_unspendable(&[]));
        assert!(!is_unspendable(&[0x51]));
    }
}
