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

//! On-flash entry format identification.

use alloc::boxed::Box;

/// Identifies one on-flash entry format.
///
/// The magic is the first word of every entry header. Different stores should
/// use different magics so that entries from a stale image are rejected
/// rather than misinterpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryFormat {
    /// Format identifier written as the first header word.
    pub magic: u32,
}

/// The set of entry formats a store accepts.
///
/// The first format is used for all new entries; the remaining formats are
/// accepted when reading, which permits migrating a store to a new format
/// in place.
#[derive(Clone, Debug)]
pub(crate) struct EntryFormats(Box<[EntryFormat]>);

impl EntryFormats {
    /// Builds the accepted format set. `formats` must not be empty.
    pub fn new(formats: &[EntryFormat]) -> Option<EntryFormats> {
        if formats.is_empty() {
            return None;
        }
        Some(EntryFormats(formats.to_vec().into_boxed_slice()))
    }

    /// The format used to write new entries.
    pub fn primary(&self) -> EntryFormat {
        self.0[0]
    }

    /// Whether `magic` identifies an accepted format.
    pub fn contains(&self, magic: u32) -> bool {
        self.0.iter().any(|format| format.magic == magic)
    }

    /// The number of accepted formats.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}
