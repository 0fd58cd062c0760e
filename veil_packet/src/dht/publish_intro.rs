/*! PublishIntroMessage: store a signed introset in the DHT.
*/

use nom::bytes::complete::tag;
use nom::number::complete::{le_u64, le_u8};

use veil_binary_io::*;

use crate::introset::IntroSet;

/** Ask the DHT to store an introset at the nodes closest to its address.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x62`
`8`      | Transaction id
`1`      | Replication count
variable | `IntroSet`

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishIntroMessage {
    /// Id the publish confirmation is matched by.
    pub tx_id: u64,
    /// How many nodes should store the set.
    pub replication: u8,
    /// The signed set to store.
    pub introset: IntroSet,
}

impl FromBytes for PublishIntroMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x62][..])(input)?;
        let (input, tx_id) = le_u64(input)?;
        let (input, replication) = le_u8(input)?;
        let (input, introset) = IntroSet::from_bytes(input)?;
        Ok((
            input,
            PublishIntroMessage {
                tx_id,
                replication,
                introset,
            },
        ))
    }
}

impl ToBytes for PublishIntroMessage {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x62) >>
            gen_le_u64!(self.tx_id) >>
            gen_be_u8!(self.replication) >>
            gen_call!(|buf, introset| IntroSet::to_bytes(introset, buf), &self.introset)
        )
    }
}
