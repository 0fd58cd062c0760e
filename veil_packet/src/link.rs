/*! Messages transported over a link session, each fragmented and framed by
the link layer.
*/

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{map, rest, verify};

use veil_binary_io::*;
use veil_crypto::*;

use crate::fragment::MAX_LINK_MSG_SIZE;
use crate::path_id::PathId;
use crate::router_contact::RouterContact;

/** Link intro message: the first message over an established transport
carrying the sender's router contact and its key-exchange nonce.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x01`
variable | `RouterContact`
`24`     | Key-exchange nonce

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkIntroMessage {
    /// Contact of the sending router.
    pub rc: RouterContact,
    /// Nonce the sender's transmit key is derived with.
    pub nonce: Nonce,
}

impl FromBytes for LinkIntroMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x01][..])(input)?;
        let (input, rc) = RouterContact::from_bytes(input)?;
        let (input, nonce) = <[u8; 24]>::from_bytes(input)?;
        Ok((input, LinkIntroMessage { rc, nonce }))
    }
}

impl ToBytes for LinkIntroMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x01) >>
            gen_call!(|buf, rc| RouterContact::to_bytes(rc, buf), &self.rc) >>
            gen_slice!(self.nonce)
        )
    }
}

/** Frame relayed along a path. The payload is onion encrypted with the
per-hop keys of the path named by `path_id`.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x02` upstream or `0x03` downstream
`16`     | Path id at the receiving router
`24`     | Nonce the onion layers were applied under
variable | Layered ciphertext

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayFrame {
    /// Path id the receiving router routes the frame by.
    pub path_id: PathId,
    /// Nonce shared by all onion layers of the payload.
    pub nonce: Nonce,
    /// Layered ciphertext.
    pub payload: Vec<u8>,
}

impl RelayFrame {
    fn parse_after_tag(input: &[u8]) -> IResult<&[u8], RelayFrame> {
        let (input, path_id) = PathId::from_bytes(input)?;
        let (input, nonce) = <[u8; 24]>::from_bytes(input)?;
        let (input, payload) = rest(input)?;
        Ok((
            input,
            RelayFrame {
                path_id,
                nonce,
                payload: payload.to_vec(),
            },
        ))
    }

    #[rustfmt::skip]
    fn gen_after_tag<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, path_id| PathId::to_bytes(path_id, buf), &self.path_id) >>
            gen_slice!(self.nonce) >>
            gen_slice!(self.payload.clone()) >>
            gen_len_limit(MAX_LINK_MSG_SIZE)
        )
    }
}

/// Every message a link session can deliver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkMessage {
    /// `LinkIntroMessage` structure.
    Intro(LinkIntroMessage),
    /// Relay frame travelling away from the path owner.
    RelayUpstream(RelayFrame),
    /// Relay frame travelling towards the path owner.
    RelayDownstream(RelayFrame),
}

impl FromBytes for LinkMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = verify(nom::combinator::rest_len, |len| {
            *len <= MAX_LINK_MSG_SIZE
        })(input)?;
        alt((
            map(LinkIntroMessage::from_bytes, LinkMessage::Intro),
            map(
                |input| {
                    let (input, _) = tag(&[0x02][..])(input)?;
                    RelayFrame::parse_after_tag(input)
                },
                LinkMessage::RelayUpstream,
            ),
            map(
                |input| {
                    let (input, _) = tag(&[0x03][..])(input)?;
                    RelayFrame::parse_after_tag(input)
                },
                LinkMessage::RelayDownstream,
            ),
        ))(input)
    }
}

impl ToBytes for LinkMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            LinkMessage::Intro(msg) => msg.to_bytes(buf),
            LinkMessage::RelayUpstream(frame) => do_gen!(buf,
                gen_be_u8!(0x02) >>
                gen_call!(|buf, frame| RelayFrame::gen_after_tag(frame, buf), frame)
            ),
            LinkMessage::RelayDownstream(frame) => do_gen!(buf,
                gen_be_u8!(0x03) >>
                gen_call!(|buf, frame| RelayFrame::gen_after_tag(frame, buf), frame)
            ),
        }
    }
}
