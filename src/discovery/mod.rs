//! Locating bridges on the local network.
//!
//! - **`protocol`**: the NetFinder identify request/reply datagram codec.
//! - **`service`**: broadcasts requests on every interface and collects replies.

pub mod protocol;
pub mod service;

pub use protocol::{
    decode_reply, decode_request, encode_request, DiscoveryReply, DiscoveryRequest, IpAssignment,
    MacAddress, Uptime, Version, NETFINDER_PORT,
};
pub use service::{discover, discover_first, local_ipv4_interfaces, Discovery, DiscoveryOptions};
