use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use super::AddressRange;

/// Walks one [`AddressRange`] in ascending order without materializing it.
///
/// A `/8` is 16M addresses; the cursor only ever holds the next value.
#[derive(Debug, Clone)]
pub struct AddressCursor {
    inner: RangeInclusive<u32>,
}

impl AddressCursor {
    pub(super) fn new(range: AddressRange) -> Self {
        Self {
            inner: range.start..=range.end,
        }
    }
}

impl Iterator for AddressCursor {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Ipv4Addr::from)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Chains the cursors of every range, range by range, in the given order.
pub fn addresses(ranges: &[AddressRange]) -> impl Iterator<Item = Ipv4Addr> + '_ {
    ranges.iter().flat_map(AddressRange::iter)
}
