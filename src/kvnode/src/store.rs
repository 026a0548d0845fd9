// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Versioned in-memory store. Writes and deletes only apply when they
//! carry a version newer than the stored one; the version that ends up
//! installed is always returned so replies can carry it back to the LB.
//! Deletes leave a tombstone so version monotonicity survives removal.

use crate::{KV_DELETE, KV_GET, KV_ITEM_CURRENT, KV_PUT, KV_STALE_DISCARD};

use common::Version;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol_pegasus::ResultCode;

#[derive(Clone, Debug)]
struct Item {
    value: Option<Box<[u8]>>,
    ver: Version,
}

pub struct Store {
    data: DashMap<Box<[u8]>, Item>,
    default_value: Box<[u8]>,
}

impl Store {
    pub fn new(default_value: &[u8]) -> Self {
        Self {
            data: DashMap::new(),
            default_value: default_value.into(),
        }
    }

    /// Read a key. Absent or deleted keys return `NotFound` with the
    /// default value; the version is the installed version (0 when the key
    /// has never been written).
    pub fn read(&self, key: &[u8]) -> (ResultCode, Box<[u8]>, Version) {
        KV_GET.increment();
        match self.data.get(key) {
            Some(item) => match &item.value {
                Some(value) => (ResultCode::Ok, value.clone(), item.ver),
                None => (ResultCode::NotFound, self.default_value.clone(), item.ver),
            },
            None => (ResultCode::NotFound, self.default_value.clone(), 0),
        }
    }

    /// Install `value` at `ver` if `ver` is newer than the stored version.
    /// Returns the version installed after the operation, which is the
    /// stored version when the write is discarded as stale.
    pub fn write(&self, key: &[u8], value: &[u8], ver: Version) -> Version {
        match self.data.entry(key.into()) {
            Entry::Occupied(mut e) => {
                let item = e.get_mut();
                if ver > item.ver {
                    item.value = Some(value.into());
                    item.ver = ver;
                    KV_PUT.increment();
                } else {
                    KV_STALE_DISCARD.increment();
                }
                item.ver
            }
            Entry::Vacant(v) => {
                v.insert(Item {
                    value: Some(value.into()),
                    ver,
                });
                KV_PUT.increment();
                KV_ITEM_CURRENT.add(1);
                ver
            }
        }
    }

    /// Tombstone a key at `ver` if `ver` is newer than the stored version.
    /// Same version discipline and return value as `write`.
    pub fn delete(&self, key: &[u8], ver: Version) -> Version {
        match self.data.entry(key.into()) {
            Entry::Occupied(mut e) => {
                let item = e.get_mut();
                if ver > item.ver {
                    item.value = None;
                    item.ver = ver;
                    KV_DELETE.increment();
                } else {
                    KV_STALE_DISCARD.increment();
                }
                item.ver
            }
            Entry::Vacant(v) => {
                // a delete racing ahead of the write it supersedes still
                // pins the version
                v.insert(Item { value: None, ver });
                KV_DELETE.increment();
                KV_ITEM_CURRENT.add(1);
                ver
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    pub fn clear(&self) {
        KV_ITEM_CURRENT.sub(self.data.len() as i64);
        self.data.clear();
    }
}
