use super::varint::VarInt;
use crate::leaf::MAX_SCRIPT_SIZE;
use bitcoin::consensus::encode::Error;
use bitcoin::consensus::{Decodable, Encodable};
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, ScriptBuf};
use bitcoin::{PubkeyHash, PublicKey, ScriptHash, opcodes};

pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

const NUM_SPECIAL_SCRIPTS: u64 = 6;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;

// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/compressor.cpp#L140
//
// Defined for 0 <= n <= MAX_MONEY.
pub fn compress_amount(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut e = 0;
    let mut n = n;
    while n % 10 == 0 && e < 9 {
        n /= 10;
        e += 1;
    }
    if e < 9 {
        let d = n % 10;
        n /= 10;
        1 + (n * 9 + d - 1) * 10 + e
    } else {
        1 + (n - 1) * 10 + 9
    }
}

/// Inverse of [`compress_amount`], `None` when the result does not fit a u64.
pub fn decompress_amount(x: u64) -> Option<u64> {
    if x == 0 {
        return Some(0);
    }
    let mut x = x - 1;
    let e = x % 10;
    x /= 10;
    let mut n = if e < 9 {
        let d = (x % 9) + 1;
        x /= 9;
        x.checked_mul(10)?.checked_add(d)?
    } else {
        x + 1
    };
    for _ in 0..e {
        n = n.checked_mul(10)?;
    }
    Some(n)
}

fn to_key_id(script: &[u8]) -> Option<&[u8]> {
    (script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG)
        .then(|| &script[3..23])
}

fn to_script_id(script: &[u8]) -> Option<&[u8]> {
    (script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL)
        .then(|| &script[2..22])
}

fn compress_script(script: &[u8]) -> Option<Vec<u8>> {
    if let Some(hash) = to_key_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x00);
        out.extend_from_slice(hash);
        return Some(out);
    }
    if let Some(hash) = to_script_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x01);
        out.extend_from_slice(hash);
        return Some(out);
    }
    if script.len() == 35
        && script[0] == 33
        && script[34] == OP_CHECKSIG
        && (script[1] == 0x02 || script[1] == 0x03)
    {
        return Some(script[1..34].to_vec());
    }
    // Only keys that decompress back to the same script are compressible.
    if script.len() == 67
        && script[0] == 65
        && script[66] == OP_CHECKSIG
        && script[1] == 0x04
        && bitcoin::Script::from_bytes(script).p2pk_public_key().is_some()
    {
        let mut out = Vec::with_capacity(33);
        out.push(0x04 | (script[65] & 0x01));
        out.extend_from_slice(&script[2..34]);
        return Some(out);
    }
    None
}

/// Locking script in Bitcoin Core's compressed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCompression(pub ScriptBuf);

impl Encodable for ScriptCompression {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        if let Some(compressed) = compress_script(self.0.as_bytes()) {
            writer.write_all(&compressed)?;
            return Ok(compressed.len());
        }

        let size = self.0.len() as u64 + NUM_SPECIAL_SCRIPTS;
        let len = VarInt(size).consensus_encode(writer)?;
        writer.write_all(self.0.as_bytes())?;
        Ok(len + self.0.len())
    }
}

impl Decodable for ScriptCompression {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let size = u64::from(VarInt::consensus_decode(reader)?);

        match size {
            0x00 => {
                let mut bytes = [0; 20];
                reader.read_exact(&mut bytes)?;
                Ok(Self(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(bytes))))
            }
            0x01 => {
                let mut bytes = [0; 20];
                reader.read_exact(&mut bytes)?;
                Ok(Self(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(bytes))))
            }
            0x02 | 0x03 => {
                let mut bytes = [0; 32];
                reader.read_exact(&mut bytes)?;

                let mut script_bytes = Vec::with_capacity(35);
                script_bytes.push(opcodes::all::OP_PUSHBYTES_33.to_u8());
                script_bytes.push(size as u8);
                script_bytes.extend_from_slice(&bytes);
                script_bytes.push(opcodes::all::OP_CHECKSIG.to_u8());

                Ok(Self(ScriptBuf::from(script_bytes)))
            }
            0x04 | 0x05 => {
                let mut bytes = [0; 32];
                reader.read_exact(&mut bytes)?;

                let mut compressed_pubkey_bytes = Vec::with_capacity(33);
                compressed_pubkey_bytes.push((size - 2) as u8);
                compressed_pubkey_bytes.extend_from_slice(&bytes);

                let compressed_pubkey = PublicKey::from_slice(&compressed_pubkey_bytes)
                    .map_err(|_| Error::ParseFailed("Failed to parse PublicKey"))?;
                let inner_uncompressed = compressed_pubkey.inner.serialize_uncompressed();

                let mut script_bytes = Vec::with_capacity(67);
                script_bytes.push(opcodes::all::OP_PUSHBYTES_65.to_u8());
                script_bytes.extend_from_slice(&inner_uncompressed);
                script_bytes.push(opcodes::all::OP_CHECKSIG.to_u8());

                Ok(Self(ScriptBuf::from(script_bytes)))
            }
            _ => {
                let size = size - NUM_SPECIAL_SCRIPTS;
                if size > MAX_SCRIPT_SIZE as u64 {
                    // Oversized scripts are replaced by an unspendable stub, their bytes skipped.
                    let mut remaining = size;
                    let mut chunk = [0u8; 1024];
                    while remaining > 0 {
                        let take = remaining.min(chunk.len() as u64) as usize;
                        reader.read_exact(&mut chunk[..take])?;
                        remaining -= take as u64;
                    }
                    let script = Builder::new()
                        .push_opcode(opcodes::all::OP_RETURN)
                        .into_script();
                    Ok(Self(script))
                } else {
                    let mut bytes = vec![0u8; size as usize];
                    reader.read_exact(&mut bytes)?;
                    Ok(Self(ScriptBuf::from_bytes(bytes)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reencode(script: &[u8]) -> (Vec<u8>, ScriptBuf) {
        let compression = ScriptCompression(ScriptBuf::from_bytes(script.to_vec()));
        let encoded = bitcoin::consensus::serialize(&compression);
        let decoded: ScriptCompression = bitcoin::consensus::deserialize(&encoded).unwrap();
        (encoded, decoded.0)
    }

    #[test]
    fn test_compress_amount() {
        for n in [0, 1, 10, 546, 50_0000_0000, MAX_MONEY, fastrand::u64(..MAX_MONEY)] {
            assert_eq!(Some(n), decompress_amount(compress_amount(n)));
        }
        // Vectors from Bitcoin Core's compress_tests.
        assert_eq!(compress_amount(0), 0x0);
        assert_eq!(compress_amount(1), 0x1);
        assert_eq!(compress_amount(100_000_000), 0x9);
        assert_eq!(compress_amount(50 * 100_000_000), 0x32);
        assert_eq!(compress_amount(21_000_000 * 100_000_000), 0x1406f40);
    }

    #[test]
    fn p2pkh_and_p2sh_compress_to_21_bytes() {
        let p2pkh = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([9u8; 20]));
        let (encoded, decoded) = reencode(p2pkh.as_bytes());
        assert_eq!(encoded.len(), 21);
        assert_eq!(encoded[0], 0x00);
        assert_eq!(decoded, p2pkh);

        let p2sh = ScriptBuf::new_p2sh(&ScriptHash::from_byte_array([4u8; 20]));
        let (encoded, decoded) = reencode(p2sh.as_bytes());
        assert_eq!(encoded.len(), 21);
        assert_eq!(encoded[0], 0x01);
        assert_eq!(decoded, p2sh);
    }

    #[test]
    fn p2pk_round_trip() {
        // Generator point.
        let compressed = hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798").unwrap();
        let key = PublicKey::from_slice(&compressed).unwrap();

        let mut script = vec![33];
        script.extend_from_slice(&compressed);
        script.push(OP_CHECKSIG);
        let (encoded, decoded) = reencode(&script);
        assert_eq!(encoded.len(), 33);
        assert_eq!(decoded.as_bytes(), script.as_slice());

        let mut script = vec![65];
        script.extend_from_slice(&key.inner.serialize_uncompressed());
        script.push(OP_CHECKSIG);
        let (encoded, decoded) = reencode(&script);
        assert_eq!(encoded.len(), 33);
        assert_eq!(encoded[0], 0x04);
        assert_eq!(decoded.as_bytes(), script.as_slice());
    }

    #[test]
    fn other_scripts_are_length_prefixed() {
        let witness = hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        let (encoded, decoded) = reencode(&witness);
        assert_eq!(encoded[0], 22 + 6);
        assert_eq!(decoded.as_bytes(), witness.as_slice());

        let (encoded, decoded) = reencode(&[]);
        assert_eq!(encoded, vec![6]);
        assert!(decoded.is_empty());
    }

    #[test]
    fn oversized_script_decodes_unspendable() {
        let big = vec![0x51u8; MAX_SCRIPT_SIZE + 1];
        let (_, decoded) = reencode(&big);
        assert_eq!(decoded.as_bytes(), &[opcodes::all::OP_RETURN.to_u8()]);
    }
}
