use bitcoin::consensus::encode::Error;
use bitcoin::consensus::{Decodable, Encodable};

/// Bitcoin Core's `VARINT`: base-128 digits, most significant first, with the
/// continuation bit set on every byte but the last and an offset of one per digit.
///
/// Unrelated to the compact size prefix of consensus vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarInt(pub u64);

impl Encodable for VarInt {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut tmp = [0u8; 10];
        let mut n = self.0;
        let mut len = 0;
        loop {
            tmp[len] = (n & 0x7f) as u8 | if len > 0 { 0x80 } else { 0x00 };
            if n <= 0x7f {
                break;
            }
            n = (n >> 7) - 1;
            len += 1;
        }
        let bytes: Vec<u8> = tmp[..=len].iter().rev().copied().collect();
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }
}

impl Decodable for VarInt {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let mut n: u64 = 0;
        loop {
            let byte = u8::consensus_decode(reader)?;
            if n > u64::MAX >> 7 {
                return Err(Error::ParseFailed("VARINT too large"));
            }
            n = (n << 7) | u64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(Self(n));
            }
            if n == u64::MAX {
                return Err(Error::ParseFailed("VARINT too large"));
            }
            n += 1;
        }
    }
}

impl From<VarInt> for u64 {
    fn from(value: VarInt) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(n: u64) -> Vec<u8> {
        bitcoin::consensus::serialize(&VarInt(n))
    }

    #[test]
    fn known_encodings() {
        // Vectors from Bitcoin Core's serialize_tests.
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(0x7f), vec![0x7f]);
        assert_eq!(encode(0x80), vec![0x80, 0x00]);
        assert_eq!(encode(0x1234), vec![0xa3, 0x34]);
        assert_eq!(encode(0xffff), vec![0x82, 0xfe, 0x7f]);
        assert_eq!(encode(0x123456), vec![0xc7, 0xe7, 0x56]);
        assert_eq!(encode(0x80123456), vec![0x86, 0xff, 0xc7, 0xe7, 0x56]);
        assert_eq!(
            encode(u64::MAX),
            vec![0x80, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0x7f]
        );
    }

    #[test]
    fn decode_inverts_encode() {
        let mut rng = fastrand::Rng::with_seed(3);
        for _ in 0..1000 {
            let n = rng.u64(..) >> rng.u32(0..64);
            let decoded: VarInt = bitcoin::consensus::deserialize(&encode(n)).unwrap();
            assert_eq!(decoded.0, n);
        }
    }

    #[test]
    fn overflow_is_rejected() {
        let bytes = [0xffu8; 11];
        assert!(VarInt::consensus_decode(&mut bytes.as_slice()).is_err());
    }
}
