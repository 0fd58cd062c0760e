/*! `PathId`: identifier of one direction of a path at one hop.
*/

use nom::combinator::map;

use veil_binary_io::*;

/// Size of a path id in bytes.
pub const PATH_ID_SIZE: usize = 16;

/// Identifier a hop uses to route frames belonging to one direction of a
/// path. A hop's `(rx_id, tx_id)` pair is unique among the local node's
/// active paths.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PathId(pub [u8; PATH_ID_SIZE]);

impl PathId {
    /// Generate a random path id.
    pub fn random() -> PathId {
        PathId(rand::random())
    }

    /// Check if all bytes are zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; PATH_ID_SIZE]
    }
}

impl std::fmt::Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromBytes for PathId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; PATH_ID_SIZE]>::from_bytes, PathId)(input)
    }
}

impl ToBytes for PathId {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(path_id_encode_decode, PathId([42; PATH_ID_SIZE]));

    #[test]
    fn random_path_ids_differ() {
        assert_ne!(PathId::random(), PathId::random());
    }
}
