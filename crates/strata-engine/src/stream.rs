//! Listing comparison for partition replication.

use std::cmp::Ordering;

use strata_types::IndexItem;

/// Local rows the remote listing lacks, in one linear pass.
///
/// Both listings must be sorted by `(hash, shard)`, which is the index
/// key order. A local row is skipped when the remote has the same key with
/// the same `(timestamp, nursery, deletion)`. Nursery rows are never
/// replicated by partition jobs; the stabilizer owns them.
pub fn items_missing_remotely<'a>(
    local: &'a [IndexItem],
    remote: &'a [IndexItem],
) -> impl Iterator<Item = &'a IndexItem> + 'a {
    let mut ri = 0usize;
    local.iter().filter(move |item| {
        if item.nursery {
            return false;
        }
        while ri < remote.len() {
            let other = &remote[ri];
            match (other.hash, other.shard).cmp(&(item.hash, item.shard)) {
                Ordering::Less => ri += 1,
                Ordering::Greater => return true,
                Ordering::Equal => {
                    ri += 1;
                    return !(other.timestamp == item.timestamp
                        && other.nursery == item.nursery
                        && other.deletion == item.deletion);
                }
            }
        }
        true
    })
}
