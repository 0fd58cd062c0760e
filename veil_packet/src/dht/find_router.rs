/*! FindRouterMessage: look up a router contact by router id.
*/

use nom::bytes::complete::tag;
use nom::number::complete::le_u64;

use veil_binary_io::*;

use crate::router_contact::RouterId;

/** Request the contact of the router whose id is `target`.

Serialized form:

Length | Content
------ | ------
`1`    | `0x63`
`8`    | Transaction id
`32`   | Target router id

*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FindRouterMessage {
    /// Id the response is matched to the request by.
    pub tx_id: u64,
    /// Router to look up.
    pub target: RouterId,
}

impl FromBytes for FindRouterMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x63][..])(input)?;
        let (input, tx_id) = le_u64(input)?;
        let (input, target) = RouterId::from_bytes(input)?;
        Ok((input, FindRouterMessage { tx_id, target }))
    }
}

impl ToBytes for FindRouterMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x63) >>
            gen_le_u64!(self.tx_id) >>
            gen_call!(|buf, target| RouterId::to_bytes(target, buf), &self.target)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(
        find_router_encode_decode,
        FindRouterMessage {
            tx_id: 12345,
            target: RouterId([42; 32]),
        }
    );
}
