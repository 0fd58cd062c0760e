/*! Wire packets of the veil overlay protocol.

Every type implements `FromBytes`/`ToBytes` from `veil_binary_io`. Types that
carry an encrypted payload also provide an in-type constructor that encrypts
and a `get_payload`-style accessor that decrypts.

*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate cookie_factory;

pub mod dht;
pub mod error;
pub mod fragment;
pub mod introset;
pub mod ip_port;
pub mod link;
pub mod path_id;
pub mod protocol;
pub mod router_contact;
pub mod routing;
pub mod service_info;
