//! Kademlia node Id, storage key or a lookup target
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id, a storage key, or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Hash an arbitrary application key into an [Id] with SHA-1.
    pub fn encode_key(key: &[u8]) -> Id {
        Id(sha1_smol::Sha1::from(key).digest().bytes())
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Full XOR metric, comparable with `Ord` as a big endian unsigned integer.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0).enumerate() {
            result[i] = a ^ b;
        }

        result.into()
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        let byte = self.0[index / 8];

        byte & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of this Id with the bit at `index` set to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Id {
        let mut bytes = self.0;
        let mask = 0x80 >> (index % 8);

        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }

        Id(bytes)
    }

    /// Returns a random Id sharing the first `prefix_len` bits with `prefix`.
    pub fn random_with_prefix(prefix: &Id, prefix_len: usize) -> Id {
        let mut id = Id::random();

        for index in 0..prefix_len.min(ID_BITS) {
            id = id.with_bit(index, prefix.bit(index));
        }

        id
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl From<Id> for [u8; ID_SIZE] {
    fn from(value: Id) -> Self {
        value.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if s.len() % 2 != 0 {
            return Err(DecodeIdError::OddNumberOfCharacters);
        }

        let mut bytes = Vec::with_capacity(s.len() / 2);

        for i in 0..s.len() / 2 {
            let pair = s
                .get(i * 2..i * 2 + 2)
                .ok_or(DecodeIdError::InvalidHexCharacter)?;

            bytes.push(u8::from_str_radix(pair, 16).map_err(|_| DecodeIdError::InvalidHexCharacter)?);
        }

        Ok(Id::from_bytes(bytes)?)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

#[derive(Debug, thiserror::Error)]
/// Bytes of the wrong length were given to [Id::from_bytes].
#[error("Invalid Id size, expected {ID_SIZE}, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(Debug, thiserror::Error)]
/// Errors decoding an [Id] from its hex representation.
pub enum DecodeIdError {
    /// Id is expected to by 20 bytes.
    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),

    #[error("Hex encoding should contain an even number of hex digits")]
    /// Hex encoding should contain an even number of hex digits
    OddNumberOfCharacters,

    /// Invalid hex character
    #[error("Invalid Id encoding")]
    InvalidHexCharacter,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = Id::random();
        let distance = id.distance(&id);
        assert_eq!(distance, 0)
    }

    #[test]
    fn distance_to_id() {
        let id = Id::from_str("0639A1E24FBB8AB277DF033476AB0DE10FAB3BDC").unwrap();

        let target = Id::from_str("035b1aeb9737ade1a80933594f405d3f772aa08e").unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, 155)
    }

    #[test]
    fn distance_to_random_id() {
        let id = Id::random();
        let target = Id::random();

        let distance = id.distance(&target);

        assert_ne!(distance, 0)
    }

    #[test]
    fn distance_to_furthest() {
        let id = Id::random();

        let mut opposite = [0_u8; 20];
        for (i, &value) in id.as_bytes().iter().enumerate() {
            opposite[i] = value ^ 0xff;
        }
        let target = Id::from_bytes(opposite).unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, MAX_DISTANCE)
    }

    #[test]
    fn xor_orders_like_integers() {
        let target = Id::from([0; ID_SIZE]);

        let mut near = [0; ID_SIZE];
        near[19] = 0xff;
        let mut far = [0; ID_SIZE];
        far[0] = 0x01;

        assert!(Id::from(near).xor(&target) < Id::from(far).xor(&target));
    }

    #[test]
    fn bits() {
        let id = Id::from_str("8000000000000000000000000000000000000001").unwrap();

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(159));

        let flipped = id.with_bit(0, false).with_bit(1, true);
        assert!(!flipped.bit(0));
        assert!(flipped.bit(1));
    }

    #[test]
    fn random_with_prefix_keeps_prefix() {
        let prefix = Id::random();
        let id = Id::random_with_prefix(&prefix, 12);

        for index in 0..12 {
            assert_eq!(id.bit(index), prefix.bit(index));
        }
    }

    #[test]
    fn display_roundtrip() {
        let id = Id::random();

        assert_eq!(Id::from_str(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn encode_key_is_sha1() {
        let id = Id::encode_key(b"abc");

        assert_eq!(
            id.to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
