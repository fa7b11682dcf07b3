//! The HPACK static and dynamic tables.

use std::collections::VecDeque;

use bytes::Bytes;

/// RFC 7541 Appendix A. Indices are 1-based on the wire.
pub(super) const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Each table entry costs its octet lengths plus this overhead.
const ENTRY_OVERHEAD: usize = 32;

/// The shared shape of both endpoints' dynamic tables: newest entry at
/// index 62, evicting from the back when over capacity.
#[derive(Debug)]
pub(super) struct DynamicTable {
    entries: VecDeque<(Bytes, Bytes)>,
    size: usize,
    capacity: usize,
}

impl DynamicTable {
    pub(super) fn new(capacity: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            capacity,
        }
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict();
    }

    pub(super) fn insert(&mut self, name: Bytes, value: Bytes) {
        let cost = name.len() + value.len() + ENTRY_OVERHEAD;
        if cost > self.capacity {
            // An entry larger than the table empties it.
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.size += cost;
        self.entries.push_front((name, value));
        self.evict();
    }

    /// Looks up by 1-based wire index spanning static then dynamic table.
    pub(super) fn get(&self, index: usize) -> Option<(Bytes, Bytes)> {
        if index == 0 {
            return None;
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Some((
                Bytes::from_static(name.as_bytes()),
                Bytes::from_static(value.as_bytes()),
            ));
        }
        self.entries.get(index - STATIC_TABLE.len() - 1).cloned()
    }

    /// Finds the wire index for an exact match, and failing that a
    /// name-only match.
    pub(super) fn find(&self, name: &[u8], value: &[u8]) -> (Option<usize>, Option<usize>) {
        let mut name_only = None;
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if n.as_bytes() == name {
                if v.as_bytes() == value {
                    return (Some(i + 1), None);
                }
                if name_only.is_none() {
                    name_only = Some(i + 1);
                }
            }
        }
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n == name {
                if v == value {
                    return (Some(STATIC_TABLE.len() + i + 1), None);
                }
                if name_only.is_none() {
                    name_only = Some(STATIC_TABLE.len() + i + 1);
                }
            }
        }
        (None, name_only)
    }

    fn evict(&mut self) {
        while self.size > self.capacity {
            let (name, value) = self.entries.pop_back().expect("size tracked with entries");
            self.size -= name.len() + value.len() + ENTRY_OVERHEAD;
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_lookup() {
        let table = DynamicTable::new(4096);
        assert_eq!(
            table.get(2).unwrap(),
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET"))
        );
        assert_eq!(table.get(62), None);
    }

    #[test]
    fn dynamic_indexes_after_static() {
        let mut table = DynamicTable::new(4096);
        table.insert(Bytes::from_static(b"x-a"), Bytes::from_static(b"1"));
        table.insert(Bytes::from_static(b"x-b"), Bytes::from_static(b"2"));
        // Newest first.
        assert_eq!(table.get(62).unwrap().0, Bytes::from_static(b"x-b"));
        assert_eq!(table.get(63).unwrap().0, Bytes::from_static(b"x-a"));
    }

    #[test]
    fn eviction_on_capacity() {
        let mut table = DynamicTable::new(70); // fits one small entry
        table.insert(Bytes::from_static(b"x-a"), Bytes::from_static(b"1"));
        table.insert(Bytes::from_static(b"x-b"), Bytes::from_static(b"2"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(62).unwrap().0, Bytes::from_static(b"x-b"));
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut table = DynamicTable::new(40);
        table.insert(Bytes::from_static(b"x-a"), Bytes::from_static(b"1"));
        table.insert(
            Bytes::from_static(b"very-long-header-name"),
            Bytes::from_static(b"very-long-header-value-over-capacity"),
        );
        assert_eq!(table.len(), 0);
    }
}
