/*! Routing messages carried over a path, wrapped in per-hop encryption by
the sending path owner.
*/

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{map, verify};
use nom::multi::count;
use nom::number::complete::le_u8;

use veil_binary_io::*;

use crate::dht::DhtMessage;
use crate::path_id::PathId;
use crate::protocol::ProtocolFrame;

/// Maximum number of DHT messages one routing message may carry.
pub const MAX_DHT_ROUTING_MSGS: usize = 4;

/** Transfer a protocol frame to another path at the far end of this path.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x70`
`16`     | Destination path id
`24`     | Random pad nonce
variable | `ProtocolFrame`

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathTransferMessage {
    /// Path id at the terminal router the frame should be handed to.
    pub dest_path_id: PathId,
    /// Random nonce so equal frames never serialize equally.
    pub pad_nonce: [u8; 24],
    /// The frame to deliver.
    pub frame: ProtocolFrame,
}

impl PathTransferMessage {
    /// Wrap a frame for delivery to `dest_path_id`.
    pub fn new(dest_path_id: PathId, frame: ProtocolFrame) -> PathTransferMessage {
        PathTransferMessage {
            dest_path_id,
            pad_nonce: rand::random(),
            frame,
        }
    }
}

impl FromBytes for PathTransferMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x70][..])(input)?;
        let (input, dest_path_id) = PathId::from_bytes(input)?;
        let (input, pad_nonce) = <[u8; 24]>::from_bytes(input)?;
        let (input, frame) = ProtocolFrame::from_bytes(input)?;
        Ok((
            input,
            PathTransferMessage {
                dest_path_id,
                pad_nonce,
                frame,
            },
        ))
    }
}

impl ToBytes for PathTransferMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x70) >>
            gen_call!(|buf, path_id| PathId::to_bytes(path_id, buf), &self.dest_path_id) >>
            gen_slice!(self.pad_nonce) >>
            gen_call!(|buf, frame| ProtocolFrame::to_bytes(frame, buf), &self.frame)
        )
    }
}

/** A batch of DHT messages sent over a path.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x71`
`1`      | Number of messages
variable | Messages

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhtRoutingMessage {
    /// The carried DHT messages.
    pub msgs: Vec<DhtMessage>,
}

impl DhtRoutingMessage {
    /// Wrap a single DHT message.
    pub fn new(msg: DhtMessage) -> DhtRoutingMessage {
        DhtRoutingMessage { msgs: vec![msg] }
    }
}

impl FromBytes for DhtRoutingMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x71][..])(input)?;
        let (input, msgs_len) = verify(le_u8, |len| *len as usize <= MAX_DHT_ROUTING_MSGS)(input)?;
        let (input, msgs) = count(DhtMessage::from_bytes, msgs_len as usize)(input)?;
        Ok((input, DhtRoutingMessage { msgs }))
    }
}

impl ToBytes for DhtRoutingMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x71) >>
            gen_cond!(
                self.msgs.len() <= MAX_DHT_ROUTING_MSGS,
                gen_be_u8!(self.msgs.len() as u8)
            ) >>
            gen_many_ref!(&self.msgs, |buf, msg| DhtMessage::to_bytes(msg, buf))
        )
    }
}

/// Every message that can travel over a path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoutingMessage {
    /// `PathTransferMessage` structure.
    PathTransfer(PathTransferMessage),
    /// `DhtRoutingMessage` structure.
    Dht(DhtRoutingMessage),
}

impl FromBytes for RoutingMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(PathTransferMessage::from_bytes, RoutingMessage::PathTransfer),
            map(DhtRoutingMessage::from_bytes, RoutingMessage::Dht),
        ))(input)
    }
}

impl ToBytes for RoutingMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            RoutingMessage::PathTransfer(msg) => msg.to_bytes(buf),
            RoutingMessage::Dht(msg) => msg.to_bytes(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dht::{FindRouterMessage, GotIntroMessage};
    use crate::router_contact::RouterId;

    encode_decode_test!(
        dht_routing_encode_decode,
        RoutingMessage::Dht(DhtRoutingMessage {
            msgs: vec![
                DhtMessage::FindRouter(FindRouterMessage {
                    tx_id: 1,
                    target: RouterId([42; 32]),
                }),
                DhtMessage::GotIntro(GotIntroMessage {
                    tx_id: 2,
                    introsets: Vec::new(),
                }),
            ],
        })
    );
}
