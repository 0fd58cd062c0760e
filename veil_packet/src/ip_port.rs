/*! `IpPort` structure: the transport address of a router.
*/

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::map;
use nom::number::complete::{be_u16, be_u32};
use nom::sequence::tuple;

use veil_binary_io::*;

/// IP address with a port.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IpPort {
    /// IP address.
    pub ip_addr: IpAddr,
    /// Port number.
    pub port: u16,
}

impl IpPort {
    /// Create an `IpPort` from a `SocketAddr`.
    pub fn from_saddr(saddr: SocketAddr) -> IpPort {
        IpPort {
            ip_addr: saddr.ip(),
            port: saddr.port(),
        }
    }

    /// Convert to a `SocketAddr`.
    pub fn to_saddr(self) -> SocketAddr {
        SocketAddr::new(self.ip_addr, self.port)
    }
}

impl FromBytes for IpPort {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, ip_addr) = alt((
            map(tuple((tag(&[4u8][..]), be_u32)), |(_, addr)| {
                IpAddr::V4(Ipv4Addr::from(addr))
            }),
            map(
                tuple((tag(&[6u8][..]), <[u8; 16]>::from_bytes)),
                |(_, addr)| IpAddr::V6(Ipv6Addr::from(addr)),
            ),
        ))(input)?;
        let (input, port) = be_u16(input)?;
        Ok((input, IpPort { ip_addr, port }))
    }
}

impl ToBytes for IpPort {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_if_else!(self.ip_addr.is_ipv4(), gen_be_u8!(4), gen_be_u8!(6)) >>
            gen_call!(|buf: (&'a mut [u8], usize), ip_addr: &IpAddr| match ip_addr {
                IpAddr::V4(ip) => do_gen!(buf, gen_slice!(ip.octets())),
                IpAddr::V6(ip) => do_gen!(buf, gen_slice!(ip.octets())),
            }, &self.ip_addr) >>
            gen_be_u16!(self.port)
        )
    }
}
