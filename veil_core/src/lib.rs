/*! Core of a veil overlay node: authenticated link sessions over a stream
transport, multi-hop path maintenance and the hidden-service endpoint that
drives them.

*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate cookie_factory;

pub mod link;
pub mod nodedb;
pub mod path;
pub mod service;
pub mod time;
pub mod utils;
