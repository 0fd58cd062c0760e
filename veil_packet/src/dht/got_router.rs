/*! GotRouterMessage: response to a router lookup.
*/

use nom::bytes::complete::tag;
use nom::combinator::verify;
use nom::multi::count;
use nom::number::complete::{le_u64, le_u8};

use veil_binary_io::*;

use crate::router_contact::RouterContact;

/// Maximum number of contacts a response may carry.
pub const MAX_GOT_ROUTERS: usize = 8;

/** Router contacts found for a lookup.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x64`
`8`      | Transaction id of the request being answered
`1`      | Number of contacts
variable | Contacts

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GotRouterMessage {
    /// Id of the request being answered.
    pub tx_id: u64,
    /// Found contacts. Empty when the router is unknown.
    pub contacts: Vec<RouterContact>,
}

impl FromBytes for GotRouterMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x64][..])(input)?;
        let (input, tx_id) = le_u64(input)?;
        let (input, contacts_len) = verify(le_u8, |len| *len as usize <= MAX_GOT_ROUTERS)(input)?;
        let (input, contacts) = count(RouterContact::from_bytes, contacts_len as usize)(input)?;
        Ok((input, GotRouterMessage { tx_id, contacts }))
    }
}

impl ToBytes for GotRouterMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x64) >>
            gen_le_u64!(self.tx_id) >>
            gen_cond!(
                self.contacts.len() <= MAX_GOT_ROUTERS,
                gen_be_u8!(self.contacts.len() as u8)
            ) >>
            gen_many_ref!(&self.contacts, |buf, rc| RouterContact::to_bytes(rc, buf))
        )
    }
}
