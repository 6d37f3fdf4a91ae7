// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Store specification.

use crate::entry::{Entry, MAX_KEY_LENGTH};
use crate::store::{StoreError, StoreResult};
use std::collections::HashMap;

/// Models the mutable operations of a store.
///
/// The model tracks only the authoritative key-value mapping; space
/// accounting and garbage collection are checked by the
/// [driver](crate::StoreDriver) against the store's own bookkeeping.
#[derive(Clone, Debug)]
pub struct StoreModel {
    /// Represents the content of the store.
    content: HashMap<String, Vec<u8>>,

    /// The modeled sector size, bounding entry sizes.
    sector_size_bytes: usize,

    /// The modeled partition alignment.
    alignment_bytes: usize,
}

/// Mutable operations on a store.
#[derive(Clone, Debug)]
pub enum StoreOperation {
    /// Writes a value for a key, overwriting any existing value.
    Put {
        /// The written key.
        key: String,

        /// The written value.
        value: Vec<u8>,
    },

    /// Removes a key.
    Delete {
        /// The removed key.
        key: String,
    },

    /// Reclaims all superseded space.
    GarbageCollect,
}

impl StoreModel {
    /// Creates an empty model for a given partition geometry.
    pub fn new(sector_size_bytes: usize, alignment_bytes: usize) -> StoreModel {
        StoreModel {
            content: HashMap::new(),
            sector_size_bytes,
            alignment_bytes,
        }
    }

    /// Returns the modeled content.
    pub fn content(&self) -> &HashMap<String, Vec<u8>> {
        &self.content
    }

    /// Simulates a store operation.
    pub fn apply(&mut self, operation: &StoreOperation) -> StoreResult<()> {
        match operation {
            StoreOperation::Put { key, value } => self.put(key, value),
            StoreOperation::Delete { key } => self.delete(key),
            StoreOperation::GarbageCollect => Ok(()),
        }
    }

    fn put(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidArgument);
        }
        let entry_size = Entry::size_for(self.alignment_bytes, key, value.len());
        if entry_size > self.sector_size_bytes || value.len() >= 0xffff {
            return Err(StoreError::InvalidArgument);
        }
        self.content.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidArgument);
        }
        match self.content.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }
}
