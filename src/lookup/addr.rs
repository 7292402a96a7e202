//! Looking up host names for an address.

use std::fmt::Write;
use std::net::IpAddr;

use crate::base::{RecordData, Rtype};
use crate::codec::Codec;
use crate::error::Error;
use crate::net::AsyncBind;
use crate::resolver::StubResolver;

//------------ lookup_addr ---------------------------------------------------

/// Resolves an IP address back into the names pointing at it.
///
/// Queries the PTR records of the address's reverse pointer name and
/// returns the names they carry.
pub async fn lookup_addr<C: Codec, B: AsyncBind>(
    resolver: &StubResolver<C, B>,
    addr: IpAddr,
) -> Result<Vec<String>, Error> {
    let name = reverse_name(addr);
    Ok(resolver
        .resolve(&name, None, &[Rtype::PTR])
        .await?
        .into_iter()
        .filter_map(|record| match record.data {
            RecordData::Ptr(name) => Some(name),
            _ => None,
        })
        .collect())
}

//------------ reverse_name --------------------------------------------------

/// Returns the reverse pointer name for an IP address.
///
/// IPv4 addresses map to the `in-addr.arpa` zone with their octets
/// reversed; IPv6 addresses to `ip6.arpa` with all 32 nibbles reversed.
pub fn reverse_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(addr) => {
            let octets = addr.octets();
            format!(
                "{}.{}.{}.{}.in-addr.arpa",
                octets[3], octets[2], octets[1], octets[0]
            )
        }
        IpAddr::V6(addr) => {
            let mut name = String::with_capacity(72);
            for octet in addr.octets().iter().rev() {
                write!(name, "{:x}.{:x}.", octet & 0xF, octet >> 4)
                    .expect("writing to a string cannot fail");
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn reverse_name_v4() {
        assert_eq!(
            reverse_name(Ipv4Addr::new(93, 184, 216, 34).into()),
            "34.216.184.93.in-addr.arpa"
        );
    }

    #[test]
    fn reverse_name_v6() {
        let addr: Ipv6Addr = "2001:db8::567:89ab".parse().unwrap();
        assert_eq!(
            reverse_name(addr.into()),
            "b.a.9.8.7.6.5.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.\
             1.0.0.2.ip6.arpa"
        );
    }
}
