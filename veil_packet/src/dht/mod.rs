/*! DHT messages carried inside the routing envelope.
*/

mod find_intro;
mod find_router;
mod got_intro;
mod got_router;
mod publish_intro;

pub use self::find_intro::*;
pub use self::find_router::*;
pub use self::got_intro::*;
pub use self::got_router::*;
pub use self::publish_intro::*;

use nom::branch::alt;
use nom::combinator::map;

use veil_binary_io::*;

/// Every DHT message this node consumes or emits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DhtMessage {
    /// `FindIntroMessage` structure.
    FindIntro(FindIntroMessage),
    /// `PublishIntroMessage` structure.
    PublishIntro(PublishIntroMessage),
    /// `GotIntroMessage` structure.
    GotIntro(GotIntroMessage),
    /// `FindRouterMessage` structure.
    FindRouter(FindRouterMessage),
    /// `GotRouterMessage` structure.
    GotRouter(GotRouterMessage),
}

impl FromBytes for DhtMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(FindIntroMessage::from_bytes, DhtMessage::FindIntro),
            map(PublishIntroMessage::from_bytes, DhtMessage::PublishIntro),
            map(GotIntroMessage::from_bytes, DhtMessage::GotIntro),
            map(FindRouterMessage::from_bytes, DhtMessage::FindRouter),
            map(GotRouterMessage::from_bytes, DhtMessage::GotRouter),
        ))(input)
    }
}

impl ToBytes for DhtMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            DhtMessage::FindIntro(msg) => msg.to_bytes(buf),
            DhtMessage::PublishIntro(msg) => msg.to_bytes(buf),
            DhtMessage::GotIntro(msg) => msg.to_bytes(buf),
            DhtMessage::FindRouter(msg) => msg.to_bytes(buf),
            DhtMessage::GotRouter(msg) => msg.to_bytes(buf),
        }
    }
}
