use sha2::{Digest, Sha512_256};
use std::fmt::{self, Write};

/// A 32-byte node hash.
///
/// The all-zero hash marks an empty node; it never commits to a real leaf.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The empty node.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Returns `true` if this is the empty node.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Returns the compact map key of this hash.
    pub fn mini(&self) -> MiniHash {
        let mut mini = [0u8; 12];
        mini.copy_from_slice(&self.0[..12]);
        MiniHash(mini)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hashes arbitrary bytes with SHA-512/256.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha512_256::digest(data).into())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.iter().fold(String::new(), |mut output, b| {
            let _ = write!(output, "{b:02x}");
            output
        });
        f.write_str(&hex)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The first 12 bytes of a [`Hash`], used to key the position map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MiniHash(pub [u8; 12]);

/// Returns `H(left ∥ right)`.
pub fn parent_hash(left: &Hash, right: &Hash) -> Hash {
    let digest = Sha512_256::new()
        .chain_update(left.0)
        .chain_update(right.0)
        .finalize();
    Hash(digest.into())
}

/// Parent hash with empty propagation: an empty child empties the parent.
pub fn rehash(left: &Hash, right: &Hash) -> Hash {
    if left.is_zero() || right.is_zero() {
        Hash::ZERO
    } else {
        parent_hash(left, right)
    }
}

/// A leaf to append to the accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub hash: Hash,
    /// Advisory flag for the pollard's caching, never part of the tree.
    pub remember: bool,
}

impl Leaf {
    pub fn new(hash: Hash, remember: bool) -> Self {
        Self { hash, remember }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha512_256_of_empty_input() {
        // FIPS 180-4 SHA-512/256("").
        assert_eq!(
            Hash::digest(b"").0,
            hex!("c672b8d1ef56ed28ab87c3622c5114069bdd3ad7b8f9737498d0c01ecef0967a")
        );
    }

    #[test]
    fn parent_hash_is_concatenation_digest() {
        let left = Hash([1u8; 32]);
        let right = Hash([2u8; 32]);
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&left.0);
        buf.extend_from_slice(&right.0);
        assert_eq!(parent_hash(&left, &right), Hash::digest(&buf));
        assert_ne!(parent_hash(&left, &right), parent_hash(&right, &left));
    }

    #[test]
    fn empty_child_empties_parent() {
        let h = Hash([7u8; 32]);
        assert!(rehash(&Hash::ZERO, &h).is_zero());
        assert!(rehash(&h, &Hash::ZERO).is_zero());
        assert!(!rehash(&h, &h).is_zero());
    }

    #[test]
    fn mini_hash_takes_prefix() {
        let mut bytes = [0u8; 32];
        bytes[..12].copy_from_slice(&[9u8; 12]);
        bytes[12] = 1;
        assert_eq!(Hash(bytes).mini(), MiniHash([9u8; 12]));
    }
}
