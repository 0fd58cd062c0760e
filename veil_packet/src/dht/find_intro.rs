/*! FindIntroMessage: look up an introset by service address or topic tag.
*/

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::map;
use nom::number::complete::{le_u64, le_u8};
use nom::sequence::preceded;

use veil_binary_io::*;

use crate::service_info::{Address, Tag};

/// What a `FindIntroMessage` looks up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupTarget {
    /// Look up the introset of one service address.
    Address(Address),
    /// Look up all introsets published under a topic tag.
    Tag(Tag),
}

impl FromBytes for LookupTarget {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(
                preceded(tag(&[0x00][..]), Address::from_bytes),
                LookupTarget::Address,
            ),
            map(
                preceded(tag(&[0x01][..]), Tag::from_bytes),
                LookupTarget::Tag,
            ),
        ))(input)
    }
}

impl ToBytes for LookupTarget {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            LookupTarget::Address(addr) => do_gen!(buf,
                gen_be_u8!(0x00) >>
                gen_call!(|buf, addr| Address::to_bytes(addr, buf), addr)
            ),
            LookupTarget::Tag(topic) => do_gen!(buf,
                gen_be_u8!(0x01) >>
                gen_call!(|buf, topic| Tag::to_bytes(topic, buf), topic)
            ),
        }
    }
}

/** Request the introset(s) stored under a service address or topic tag.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x60`
`8`      | Transaction id
variable | `LookupTarget`
`1`      | Replication count

*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FindIntroMessage {
    /// Id the response is matched to the request by.
    pub tx_id: u64,
    /// Address or tag to look up.
    pub target: LookupTarget,
    /// How many nodes the recipient should relay the request to.
    pub replication: u8,
}

impl FromBytes for FindIntroMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x60][..])(input)?;
        let (input, tx_id) = le_u64(input)?;
        let (input, target) = LookupTarget::from_bytes(input)?;
        let (input, replication) = le_u8(input)?;
        Ok((
            input,
            FindIntroMessage {
                tx_id,
                target,
                replication,
            },
        ))
    }
}

impl ToBytes for FindIntroMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x60) >>
            gen_le_u64!(self.tx_id) >>
            gen_call!(|buf, target| LookupTarget::to_bytes(target, buf), &self.target) >>
            gen_be_u8!(self.replication)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(
        find_intro_addr_encode_decode,
        FindIntroMessage {
            tx_id: 12345,
            target: LookupTarget::Address(Address([42; 32])),
            replication: 5,
        }
    );

    encode_decode_test!(
        find_intro_tag_encode_decode,
        FindIntroMessage {
            tx_id: 12345,
            target: LookupTarget::Tag(Tag::new("chat")),
            replication: 5,
        }
    );
}
