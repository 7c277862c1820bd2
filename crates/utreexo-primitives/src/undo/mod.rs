//! Bitcoin Core block undo records (the payload of `rev*.dat` entries).

mod compressor;
mod varint;

pub use self::compressor::{MAX_MONEY, ScriptCompression, compress_amount, decompress_amount};
pub use self::varint::VarInt;

use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin::{Amount, ScriptBuf};

/// Upper bound on preallocated entries while decoding untrusted counts.
const MAX_PREALLOC: usize = 4096;

/// Output consumed by a transaction input, as recorded by the undo data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    /// Height of the block that created the output.
    pub height: u32,
    pub is_coinbase: bool,
    pub amount: Amount,
    pub script_pubkey: ScriptBuf,
}

impl Encodable for SpentOutput {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let sats = self.amount.to_sat();
        if sats > MAX_MONEY {
            return Err(bitcoin::io::Error::new(
                bitcoin::io::ErrorKind::InvalidInput,
                "amount exceeds MAX_MONEY",
            ));
        }
        let code = u64::from(self.height) * 2 + u64::from(self.is_coinbase);
        let mut len = VarInt(code).consensus_encode(writer)?;
        if self.height > 0 {
            // Legacy transaction version, always written as zero.
            len += VarInt(0).consensus_encode(writer)?;
        }
        len += VarInt(compress_amount(sats)).consensus_encode(writer)?;
        len += ScriptCompression(self.script_pubkey.clone()).consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for SpentOutput {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let code = u64::from(VarInt::consensus_decode(reader)?);
        let height = u32::try_from(code >> 1)
            .map_err(|_| encode::Error::ParseFailed("undo height out of range"))?;
        if height > 0 {
            let _version = VarInt::consensus_decode(reader)?;
        }
        let amount = decompress_amount(VarInt::consensus_decode(reader)?.into())
            .ok_or(encode::Error::ParseFailed("undo amount out of range"))?;
        let ScriptCompression(script_pubkey) = ScriptCompression::consensus_decode(reader)?;

        Ok(Self {
            height,
            is_coinbase: code & 1 == 1,
            amount: Amount::from_sat(amount),
            script_pubkey,
        })
    }
}

/// Spent outputs of one transaction, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub prevouts: Vec<SpentOutput>,
}

/// Spent outputs of every non-coinbase transaction of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

fn decode_vec<T: Decodable, R: bitcoin::io::Read + ?Sized>(
    reader: &mut R,
) -> Result<Vec<T>, encode::Error> {
    let count = encode::VarInt::consensus_decode(reader)?.0 as usize;
    let mut items = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        items.push(T::consensus_decode(reader)?);
    }
    Ok(items)
}

fn encode_slice<T: Encodable, W: bitcoin::io::Write + ?Sized>(
    items: &[T],
    writer: &mut W,
) -> Result<usize, bitcoin::io::Error> {
    let mut len = encode::VarInt(items.len() as u64).consensus_encode(writer)?;
    for item in items {
        len += item.consensus_encode(writer)?;
    }
    Ok(len)
}

impl Encodable for TxUndo {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        encode_slice(&self.prevouts, writer)
    }
}

impl Decodable for TxUndo {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            prevouts: decode_vec(reader)?,
        })
    }
}

impl Encodable for BlockUndo {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        encode_slice(&self.txs, writer)
    }
}

impl Decodable for BlockUndo {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            txs: decode_vec(reader)?,
        })
    }
}
