//! Client-side buffer map: which shared segment stands in for each slot.

use std::collections::HashMap;

use device_abi::Port;
use log::debug;
use transport::SharedSegment;

use crate::segments::{BufferKey, SegmentToken};

pub struct ClientEntry {
    pub segment: SharedSegment,
    pub token: SegmentToken,
    /// Address of the server's real mapping, for mapped buffers.
    pub magic: Option<i64>,
    /// The caller's own memory, for user-pointer buffers.
    pub user_addr: Option<u64>,
}

#[derive(Default)]
pub struct ClientBufferMap {
    entries: HashMap<BufferKey, ClientEntry>,
    offsets: HashMap<u32, BufferKey>,
}

impl ClientBufferMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers which slot a `QUERYBUF` offset belongs to.
    pub fn record_offset(&mut self, offset: u32, key: BufferKey) {
        self.offsets.insert(offset, key);
    }

    pub fn key_for_offset(&self, offset: u32) -> Option<BufferKey> {
        self.offsets.get(&offset).copied()
    }

    /// Stores `entry`, dropping (and unlinking) any segment it replaces.
    pub fn insert(&mut self, key: BufferKey, entry: ClientEntry) {
        if let Some(old) = self.entries.insert(key, entry) {
            debug!("replaced segment {} for {key}", old.segment.name());
        }
    }

    pub fn get(&self, key: &BufferKey) -> Option<&ClientEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &BufferKey) -> Option<&mut ClientEntry> {
        self.entries.get_mut(key)
    }

    /// The slot whose segment is mapped at `addr` in this process.
    pub fn find_by_addr(&self, addr: usize) -> Option<BufferKey> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.segment.base_addr() == addr)
            .map(|(key, _)| *key)
    }

    pub fn find_by_token(&self, token: SegmentToken) -> Option<BufferKey> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.token == token)
            .map(|(key, _)| *key)
    }

    pub fn remove(&mut self, key: &BufferKey) -> Option<ClientEntry> {
        self.entries.remove(key)
    }

    /// Drops every entry and offset on `port`. Returns the number of entries dropped.
    pub fn release_port(&mut self, port: Port) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.port != port);
        self.offsets.retain(|_, key| key.port != port);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.offsets.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
