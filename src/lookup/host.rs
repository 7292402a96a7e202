//! Looking up host addresses.

use crate::base::{Record, Rtype};
use crate::codec::Codec;
use crate::error::Error;
use crate::net::AsyncBind;
use crate::resolver::StubResolver;

//------------ Family --------------------------------------------------------

/// The address family of a host lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    /// IPv4 addresses only.
    V4,

    /// IPv6 addresses only.
    V6,

    /// Whichever family answers first with records.
    Any,
}

impl Family {
    /// Converts the conventional numeric family, 4 or 6, into a value.
    pub fn from_number(family: u32) -> Result<Self, Error> {
        match family {
            4 => Ok(Family::V4),
            6 => Ok(Family::V6),
            other => Err(Error::InvalidFamily(other)),
        }
    }

    /// The record types queried for this family.
    fn rtypes(self) -> &'static [Rtype] {
        match self {
            Family::V4 => &[Rtype::A],
            Family::V6 => &[Rtype::AAAA],
            Family::Any => &[Rtype::A, Rtype::AAAA],
        }
    }
}

//------------ lookup_host ---------------------------------------------------

/// Resolves a host name into its addresses.
///
/// For [`Family::Any`] the A and AAAA queries race in parallel and the
/// first answer that actually carries records wins; a NoData answer for
/// one family leaves the race to the other. An empty result is an
/// authoritative negative answer.
pub async fn lookup_host<C: Codec, B: AsyncBind>(
    resolver: &StubResolver<C, B>,
    name: &str,
    family: Family,
) -> Result<Vec<Record>, Error> {
    resolver.resolve(name, None, family.rtypes()).await
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn family_from_number() {
        assert_eq!(Family::from_number(4).unwrap(), Family::V4);
        assert_eq!(Family::from_number(6).unwrap(), Family::V6);
        assert!(matches!(
            Family::from_number(5),
            Err(Error::InvalidFamily(5))
        ));
    }
}
