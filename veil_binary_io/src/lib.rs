//! Traits for binary serialization and deserialization of wire structs.

mod crypto;

pub use nom::IResult;
pub use cookie_factory::GenError;

/// The trait provides method to deserialize struct from raw bytes.
pub trait FromBytes: Sized {
    /// Deserialize struct using `nom` from raw bytes.
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self>;
}

/// The trait provides method to serialize struct into raw bytes.
pub trait ToBytes: Sized {
    /// Serialize struct into raw bytes using `cookie_factory`.
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError>;
}

macro_rules! array_from_bytes (
    ($($len:expr),+) => ($(
        impl FromBytes for [u8; $len] {
            fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
                nom::combinator::map_opt(
                    nom::bytes::streaming::take($len as usize),
                    |bytes: &[u8]| bytes.try_into().ok(),
                )(input)
            }
        }
    )+)
);

array_from_bytes!(16, 24, 32, 64, 512, 544, 1088, 1184, 2400);

/// Check that the produced length does not exceed `limit`. Supposed to be used
/// as the last element of a `do_gen!` chain.
pub fn gen_len_limit(
    buf: (&mut [u8], usize),
    limit: usize,
) -> Result<(&mut [u8], usize), GenError> {
    if buf.1 <= limit {
        Ok(buf)
    } else {
        Err(GenError::BufferTooSmall(buf.1))
    }
}

/// Decode using the same type as `witness`, letting type inference pick the
/// `FromBytes` impl from the witness value instead of the call site.
#[doc(hidden)]
pub fn decode_like<'a, T: FromBytes>(_witness: &T, input: &'a [u8]) -> IResult<&'a [u8], T> {
    T::from_bytes(input)
}

/// Test that serializing and deserializing a value yields the original value.
#[macro_export]
macro_rules! encode_decode_test (
    ($test:ident, $value:expr) => (
        #[test]
        fn $test() {
            use $crate::ToBytes;

            let value = $value;
            let mut buf = [0; 1024 * 1024];
            let (_, size) = value.to_bytes((&mut buf, 0)).unwrap();
            let (rest, decoded_value) = $crate::decode_like(&value, &buf[..size]).unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded_value, value);
        }
    )
);
