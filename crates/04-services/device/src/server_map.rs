//! Server-side buffer map: the attached segment and the backend's real
//! mapping for each slot.

use std::collections::HashMap;

use device_abi::Port;
use log::debug;
use transport::SharedSegment;

use crate::segments::{BufferKey, SegmentToken};

/// A region returned by the backend's `mmap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub addr: usize,
    pub len: usize,
}

#[derive(Default)]
pub struct ServerEntry {
    pub segment: Option<SharedSegment>,
    /// Set for user-pointer segments, which the client names by token.
    pub token: Option<SegmentToken>,
    pub mapping: Option<Mapping>,
}

impl ServerEntry {
    pub fn segment_base(&self) -> Option<usize> {
        self.segment.as_ref().map(SharedSegment::base_addr)
    }
}

#[derive(Default)]
pub struct ServerBufferMap {
    entries: HashMap<BufferKey, ServerEntry>,
    planes: HashMap<Port, usize>,
}

impl ServerBufferMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the planes per buffer from the latest format on `port`.
    pub fn set_plane_count(&mut self, port: Port, planes: usize) {
        self.planes.insert(port, planes.max(1));
    }

    pub fn plane_count(&self, port: Port) -> usize {
        self.planes.get(&port).copied().unwrap_or(1)
    }

    /// Reserves empty entries for `count` buffers on `port`. Entries left
    /// over from earlier requests are returned for release.
    pub fn reserve(&mut self, port: Port, count: u32) -> Vec<ServerEntry> {
        let released = self.take_port(port);
        let planes = self.plane_count(port) as u32;
        for index in 0..count {
            for plane in 0..planes {
                self.entries
                    .insert(BufferKey::new(port, index, plane), ServerEntry::default());
            }
        }
        debug!("reserved {count}x{planes} entries on {port:?}");
        released
    }

    pub fn take_port(&mut self, port: Port) -> Vec<ServerEntry> {
        let keys: Vec<BufferKey> = self
            .entries
            .keys()
            .filter(|key| key.port == port)
            .copied()
            .collect();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    pub fn entry(&mut self, key: BufferKey) -> &mut ServerEntry {
        self.entries.entry(key).or_default()
    }

    pub fn get(&self, key: &BufferKey) -> Option<&ServerEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &BufferKey) -> Option<&mut ServerEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &BufferKey) -> bool {
        self.entries.contains_key(key)
    }

    /// The slot whose backend mapping starts at `addr`.
    pub fn find_by_mapping(&self, addr: usize) -> Option<BufferKey> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.mapping.map(|m| m.addr) == Some(addr))
            .map(|(key, _)| *key)
    }

    /// The slot whose attached segment starts at `addr` in this process.
    pub fn find_by_segment(&self, addr: usize) -> Option<BufferKey> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.segment_base() == Some(addr))
            .map(|(key, _)| *key)
    }

    pub fn remove(&mut self, key: &BufferKey) -> Option<ServerEntry> {
        self.entries.remove(key)
    }

    pub fn drain(&mut self) -> Vec<(BufferKey, ServerEntry)> {
        self.entries.drain().collect()
    }

    pub fn keys(&self) -> Vec<BufferKey> {
        let mut keys: Vec<BufferKey> = self.entries.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_uses_the_port_plane_count() {
        let mut map = ServerBufferMap::new();
        map.set_plane_count(Port::Capture, 2);
        assert!(map.reserve(Port::Capture, 3).is_empty());
        assert!(map.reserve(Port::Output, 4).is_empty());
        assert_eq!(map.len(), 10);
        assert!(map.contains(&BufferKey::new(Port::Capture, 2, 1)));
        assert!(map.contains(&BufferKey::new(Port::Output, 3, 0)));
        assert!(!map.contains(&BufferKey::new(Port::Output, 0, 1)));

        assert_eq!(map.reserve(Port::Capture, 1).len(), 6);
        assert_eq!(map.len(), 6);
    }

    #[test]
    fn finds_slots_by_backend_mapping() {
        let mut map = ServerBufferMap::new();
        map.reserve(Port::Output, 2);
        let key = BufferKey::new(Port::Output, 1, 0);
        map.entry(key).mapping = Some(Mapping {
            addr: 0x7000,
            len: 4096,
        });
        assert_eq!(map.find_by_mapping(0x7000), Some(key));
        assert_eq!(map.find_by_mapping(0x8000), None);
        assert_eq!(map.drain().len(), 2);
        assert!(map.is_empty());
    }
}
