//! Guest address resolution
//!
//! Parses the guest agent's `network-get-interfaces` reply. `qm guest cmd`
//! prints the bare result array; the raw agent protocol wraps it in
//! `{"return": [...]}`. Both shapes are accepted.

use crate::error::VmgateResult;
use serde::Deserialize;
use std::net::Ipv4Addr;
use tracing::debug;

/// Guest agent command listing interfaces and addresses
pub const INTERFACES_COMMAND: &str = "network-get-interfaces";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InterfacesReply {
    Bare(Vec<GuestInterface>),
    Wrapped {
        #[serde(rename = "return")]
        result: Vec<GuestInterface>,
    },
}

#[derive(Debug, Deserialize)]
struct GuestInterface {
    #[serde(default)]
    name: String,
    #[serde(rename = "ip-addresses", default)]
    addresses: Vec<GuestAddress>,
}

#[derive(Debug, Deserialize)]
struct GuestAddress {
    #[serde(rename = "ip-address-type")]
    kind: String,
    #[serde(rename = "ip-address")]
    address: String,
}

/// First non-loopback IPv4 address in interface order
pub fn first_ipv4(reply: &str) -> VmgateResult<Option<Ipv4Addr>> {
    let interfaces = match serde_json::from_str::<InterfacesReply>(reply)? {
        InterfacesReply::Bare(list) | InterfacesReply::Wrapped { result: list } => list,
    };

    let found = interfaces
        .iter()
        .filter(|iface| iface.name != "lo")
        .flat_map(|iface| iface.addresses.iter())
        .filter(|addr| addr.kind == "ipv4")
        .filter_map(|addr| addr.address.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified());

    Ok(found)
}

/// Like [`first_ipv4`] but treats an unparsable reply as "nothing yet"
pub(crate) fn try_first_ipv4(reply: &str) -> Option<Ipv4Addr> {
    match first_ipv4(reply) {
        Ok(found) => found,
        Err(e) => {
            debug!("Unparsable interface list: {}", e);
            None
        }
    }
}
