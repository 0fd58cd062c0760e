/*! GotIntroMessage: response to a lookup or publish of introsets.
*/

use nom::bytes::complete::tag;
use nom::combinator::verify;
use nom::multi::count;
use nom::number::complete::{le_u64, le_u8};

use veil_binary_io::*;

use crate::introset::IntroSet;

/// Maximum number of introsets a response may carry.
pub const MAX_GOT_INTROSETS: usize = 8;

/** Introsets found for a lookup, or the echo confirming a publish.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x61`
`8`      | Transaction id of the request being answered
`1`      | Number of introsets
variable | Introsets

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GotIntroMessage {
    /// Id of the request being answered.
    pub tx_id: u64,
    /// Found introsets. Empty when nothing was found.
    pub introsets: Vec<IntroSet>,
}

impl FromBytes for GotIntroMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x61][..])(input)?;
        let (input, tx_id) = le_u64(input)?;
        let (input, introsets_len) =
            verify(le_u8, |len| *len as usize <= MAX_GOT_INTROSETS)(input)?;
        let (input, introsets) = count(IntroSet::from_bytes, introsets_len as usize)(input)?;
        Ok((input, GotIntroMessage { tx_id, introsets }))
    }
}

impl ToBytes for GotIntroMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x61) >>
            gen_le_u64!(self.tx_id) >>
            gen_cond!(
                self.introsets.len() <= MAX_GOT_INTROSETS,
                gen_be_u8!(self.introsets.len() as u8)
            ) >>
            gen_many_ref!(&self.introsets, |buf, introset| IntroSet::to_bytes(introset, buf))
        )
    }
}
