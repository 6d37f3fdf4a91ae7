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

//! Store wrapper for testing.
//!
//! [`StoreDriver`] wraps a [`KeyValueStore`] over a [`BufferPartition`] and
//! compares its behavior with its associated [`StoreModel`], across normal
//! operation and simulated power losses.

use crate::buffer::{BufferOptions, BufferPartition, CorruptFunction};
use crate::checksum::Crc16Ccitt;
use crate::format::EntryFormat;
use crate::model::{StoreModel, StoreOperation};
use crate::store::{KeyValueStore, Options, StoreError, StoreResult};

/// The store type driven by the test driver.
pub type DriverStore = KeyValueStore<BufferPartition, Crc16Ccitt>;

/// The entry format used by driven stores.
pub const DRIVER_FORMAT: EntryFormat = EntryFormat { magic: 0x600d_f00d };

/// The partition geometry and store configuration of a driven store.
#[derive(Clone, Copy, Debug)]
pub struct DriverConfig {
    pub buffer: BufferOptions,
    pub sector_count: usize,
    pub store: Options,
}

/// Tracks the store behavior against its model and its storage.
#[derive(Clone)]
pub enum StoreDriver {
    /// When the store is running.
    On(StoreDriverOn),

    /// When the store is off.
    Off(StoreDriverOff),
}

/// Keeps a power-off store and its potential models in sync.
#[derive(Clone)]
pub struct StoreDriverOff {
    /// The partition of the store being tracked.
    partition: BufferPartition,

    config: DriverConfig,

    /// The last valid model before power off.
    model: StoreModel,

    /// In case of an interrupted operation, the model after completion.
    complete: Option<StoreModel>,
}

/// Keeps a power-on store and its model in sync.
#[derive(Clone)]
pub struct StoreDriverOn {
    /// The store being tracked.
    store: DriverStore,

    config: DriverConfig,

    /// The model associated to the store.
    model: StoreModel,

    /// High-water mark of the transaction counter within this power cycle.
    last_transaction_count: u32,
}

/// Specifies an interruption.
pub struct StoreInterruption<'a> {
    /// After how many flash operations the interruption should happen.
    pub delay: usize,

    /// How the interrupted operation should be corrupted.
    pub corrupt: CorruptFunction<'a>,
}

impl<'a> StoreInterruption<'a> {
    /// Builds an interruption that never triggers.
    pub fn none() -> StoreInterruption<'a> {
        StoreInterruption {
            delay: usize::MAX,
            corrupt: Box::new(|_, _| {}),
        }
    }

    /// Builds an interruption without corruption.
    pub fn pure(delay: usize) -> StoreInterruption<'a> {
        StoreInterruption {
            delay,
            corrupt: Box::new(|_, _| {}),
        }
    }

    /// Builds an interruption whose operation still completes.
    pub fn complete(delay: usize) -> StoreInterruption<'a> {
        StoreInterruption {
            delay,
            corrupt: Box::new(|before, after| before.copy_from_slice(after)),
        }
    }

    /// Builds an interruption completing only the first half of the change.
    pub fn half(delay: usize) -> StoreInterruption<'a> {
        StoreInterruption {
            delay,
            corrupt: Box::new(|before, after| {
                let half = before.len() / 2;
                before[..half].copy_from_slice(&after[..half]);
            }),
        }
    }
}

/// Possible ways a driver operation may fail.
#[derive(Debug)]
pub enum StoreInvariant {
    /// The store returned an unexpected error.
    StoreError(StoreError),

    /// The store did not recover an interrupted operation.
    Interrupted {
        /// Why the store does not match the state before the operation.
        rollback: Box<StoreInvariant>,

        /// Why the store does not match the state after the operation.
        complete: Box<StoreInvariant>,
    },

    /// The store returned a different result than the model.
    DifferentResult {
        /// The result of the store.
        store: StoreResult<()>,

        /// The result of the model.
        model: StoreResult<()>,
    },

    /// The store has an entry not present in the model.
    OnlyInStore {
        /// The key of the additional entry.
        key: String,
    },

    /// The store has a different value than the model for an entry.
    DifferentValue {
        /// The key of the entry with a different value.
        key: String,

        /// The value of the entry in the store.
        store: Vec<u8>,

        /// The value of the entry in the model.
        model: Vec<u8>,
    },

    /// The store is missing an entry from the model.
    OnlyInModel {
        /// The key of the missing entry.
        key: String,
    },

    /// No sector is fully erased.
    NoFreeSector,

    /// A sector's tracked valid bytes do not match its entries.
    SectorAccounting {
        /// The sector with broken accounting.
        sector: usize,

        /// The valid bytes tracked by the store.
        tracked: usize,

        /// The valid bytes recomputed from the descriptors.
        actual: usize,
    },

    /// Two copies of the same entry share a sector.
    RedundantCopiesInSameSector {
        /// The hash of the affected key.
        hash: u32,

        /// The shared sector.
        sector: usize,
    },

    /// The transaction counter decreased within a power cycle.
    NonMonotonicTransactionId {
        /// The counter before the operation.
        previous: u32,

        /// The counter after the operation.
        current: u32,
    },
}

impl From<StoreError> for StoreInvariant {
    fn from(error: StoreError) -> StoreInvariant {
        StoreInvariant::StoreError(error)
    }
}

impl StoreDriver {
    /// Extracts the power-on version of the driver.
    pub fn on(self) -> Option<StoreDriverOn> {
        match self {
            StoreDriver::On(driver) => Some(driver),
            StoreDriver::Off(_) => None,
        }
    }

    /// Powers on the store if not already on.
    pub fn power_on(self) -> Result<StoreDriverOn, StoreInvariant> {
        match self {
            StoreDriver::On(driver) => Ok(driver),
            StoreDriver::Off(driver) => driver.power_on(),
        }
    }

    /// Extracts the power-off version of the driver.
    pub fn off(self) -> Option<StoreDriverOff> {
        match self {
            StoreDriver::On(_) => None,
            StoreDriver::Off(driver) => Some(driver),
        }
    }

    /// Provides read-only access to the model.
    pub fn model(&self) -> &StoreModel {
        match self {
            StoreDriver::On(driver) => driver.model(),
            StoreDriver::Off(driver) => driver.model(),
        }
    }
}

impl StoreDriverOff {
    /// Starts a simulation with an erased partition.
    pub fn new(config: DriverConfig) -> StoreDriverOff {
        let size = config.sector_count * config.buffer.sector_size_bytes;
        let partition = BufferPartition::new(vec![0xff; size].into_boxed_slice(), config.buffer);
        let model = StoreModel::new(
            config.buffer.sector_size_bytes,
            config.buffer.alignment_bytes,
        );
        StoreDriverOff {
            partition,
            config,
            model,
            complete: None,
        }
    }

    /// Provides read-only access to the partition.
    pub fn partition(&self) -> &BufferPartition {
        &self.partition
    }

    /// Provides mutable access to the partition.
    pub fn partition_mut(&mut self) -> &mut BufferPartition {
        &mut self.partition
    }

    /// Provides read-only access to the model.
    pub fn model(&self) -> &StoreModel {
        &self.model
    }

    /// Powers on the store without interruption.
    pub fn power_on(self) -> Result<StoreDriverOn, StoreInvariant> {
        match self.partial_power_on(StoreInterruption::none())? {
            StoreDriver::On(driver) => Ok(driver),
            StoreDriver::Off(_) => unreachable!("power on was not interrupted"),
        }
    }

    /// Powers on the store with a possible interruption.
    pub fn partial_power_on(
        self,
        interruption: StoreInterruption,
    ) -> Result<StoreDriver, StoreInvariant> {
        let mut partition = self.partition;
        partition.arm_interruption(interruption.delay);
        let mut store: DriverStore =
            KeyValueStore::new(partition, &[DRIVER_FORMAT], self.config.store)?;
        match store.init() {
            Ok(()) | Err(StoreError::DataLoss) => {
                store.partition_mut().disarm_interruption();
                let config = self.config;
                // If an interrupted operation may have completed, the store
                // may match either the completed or the rolled-back model.
                let rollback = self.model;
                match self.complete {
                    Some(complete_model) => {
                        match StoreDriverOn::new(store, config, complete_model) {
                            Ok(driver) => Ok(StoreDriver::On(driver)),
                            Err((complete, store)) => {
                                match StoreDriverOn::new(store, config, rollback) {
                                    Ok(driver) => Ok(StoreDriver::On(driver)),
                                    Err((rollback, _)) => Err(StoreInvariant::Interrupted {
                                        rollback: Box::new(rollback),
                                        complete: Box::new(complete),
                                    }),
                                }
                            }
                        }
                    }
                    None => StoreDriverOn::new(store, config, rollback)
                        .map(StoreDriver::On)
                        .map_err(|(invariant, _)| invariant),
                }
            }
            Err(StoreError::Unknown) => {
                // The initialization was interrupted by the armed power loss.
                let mut partition = store.into_partition();
                partition.corrupt_operation(interruption.corrupt);
                Ok(StoreDriver::Off(StoreDriverOff {
                    partition,
                    config: self.config,
                    model: self.model,
                    complete: self.complete,
                }))
            }
            Err(error) => {
                store.partition_mut().reset_interruption();
                Err(StoreInvariant::StoreError(error))
            }
        }
    }

    /// Returns the number of flash operations to power on.
    ///
    /// Returns `None` if the store cannot power on successfully.
    pub fn count_operations(&self) -> Option<usize> {
        let initial_delay = usize::MAX;
        let mut partition = self.partition.clone();
        partition.arm_interruption(initial_delay);
        let mut store: DriverStore =
            KeyValueStore::new(partition, &[DRIVER_FORMAT], self.config.store).ok()?;
        match store.init() {
            Ok(()) | Err(StoreError::DataLoss) => (),
            Err(_) => return None,
        }
        Some(initial_delay - store.partition_mut().disarm_interruption())
    }
}

impl StoreDriverOn {
    /// Provides read-only access to the store.
    pub fn store(&self) -> &DriverStore {
        &self.store
    }

    /// Provides mutable access to the store.
    pub fn store_mut(&mut self) -> &mut DriverStore {
        &mut self.store
    }

    /// Extracts the store.
    pub fn extract_store(self) -> DriverStore {
        self.store
    }

    /// Provides read-only access to the model.
    pub fn model(&self) -> &StoreModel {
        &self.model
    }

    /// Applies a store operation to the store and model without
    /// interruption.
    pub fn apply(&mut self, operation: &StoreOperation) -> Result<(), StoreInvariant> {
        let store_result = apply_to_store(&mut self.store, operation);
        self.reconcile(operation, store_result)?;
        self.check()
    }

    /// Applies a store operation with a possible interruption.
    ///
    /// Returns the store's benign error, if any, and the driver: still on if
    /// the operation ran to an end, off if it was interrupted.
    pub fn partial_apply(
        mut self,
        operation: &StoreOperation,
        interruption: StoreInterruption,
    ) -> Result<(Option<StoreError>, StoreDriver), (DriverStore, StoreInvariant)> {
        self.store
            .partition_mut()
            .arm_interruption(interruption.delay);
        let store_result = apply_to_store(&mut self.store, operation);
        match store_result {
            Ok(())
            | Err(StoreError::InvalidArgument)
            | Err(StoreError::NotFound)
            | Err(StoreError::ResourceExhausted)
            | Err(StoreError::AlreadyExists) => {
                self.store.partition_mut().disarm_interruption();
                if let Err(invariant) = self.reconcile(operation, store_result) {
                    return Err((self.store, invariant));
                }
                Ok((store_result.err(), StoreDriver::On(self)))
            }
            Err(StoreError::Unknown) => {
                // Interrupted by the armed power loss. Depending on where it
                // hit, the operation may still be complete on flash.
                let mut complete_model = self.model.clone();
                let complete = complete_model.apply(operation).is_ok().then(|| complete_model);
                let mut partition = self.store.into_partition();
                partition.corrupt_operation(interruption.corrupt);
                Ok((
                    None,
                    StoreDriver::Off(StoreDriverOff {
                        partition,
                        config: self.config,
                        model: self.model,
                        complete,
                    }),
                ))
            }
            Err(error) => Err((self.store, StoreInvariant::StoreError(error))),
        }
    }

    /// Returns the number of flash operations to apply a store operation.
    ///
    /// Returns `None` if the store cannot apply the operation successfully.
    pub fn count_operations(&self, operation: &StoreOperation) -> Option<usize> {
        let initial_delay = usize::MAX;
        let mut store = self.store.clone();
        store.partition_mut().arm_interruption(initial_delay);
        apply_to_store(&mut store, operation).ok()?;
        Some(initial_delay - store.partition_mut().disarm_interruption())
    }

    /// Powers off the store.
    pub fn power_off(self) -> StoreDriverOff {
        StoreDriverOff {
            partition: self.store.into_partition(),
            config: self.config,
            model: self.model,
            complete: None,
        }
    }

    /// Applies a put to the store and model without interruption.
    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreInvariant> {
        self.apply(&StoreOperation::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })
    }

    /// Applies a delete to the store and model without interruption.
    pub fn delete(&mut self, key: &str) -> Result<(), StoreInvariant> {
        self.apply(&StoreOperation::Delete {
            key: key.to_string(),
        })
    }

    /// Checks that the store and model are in sync and that the store's
    /// internal accounting holds.
    pub fn check(&self) -> Result<(), StoreInvariant> {
        self.check_model()?;
        self.check_accounting()?;
        Ok(())
    }

    /// Starts tracking a powered-on store, checking it against the model.
    fn new(
        store: DriverStore,
        config: DriverConfig,
        model: StoreModel,
    ) -> Result<StoreDriverOn, (StoreInvariant, DriverStore)> {
        let last_transaction_count = store.transaction_count();
        let driver = StoreDriverOn {
            store,
            config,
            model,
            last_transaction_count,
        };
        match driver.check() {
            Ok(()) => Ok(driver),
            Err(invariant) => Err((invariant, driver.store)),
        }
    }

    /// Compares a store result against the model for the same operation.
    ///
    /// Out-of-space and hash-collision failures are not modeled: the store
    /// result stands and the model is left unchanged.
    fn reconcile(
        &mut self,
        operation: &StoreOperation,
        store_result: StoreResult<()>,
    ) -> Result<(), StoreInvariant> {
        match store_result {
            Err(StoreError::ResourceExhausted) | Err(StoreError::AlreadyExists) => (),
            _ => {
                let model_result = self.model.apply(operation);
                if store_result != model_result {
                    return Err(StoreInvariant::DifferentResult {
                        store: store_result,
                        model: model_result,
                    });
                }
            }
        }
        let current = self.store.transaction_count();
        if current < self.last_transaction_count {
            return Err(StoreInvariant::NonMonotonicTransactionId {
                previous: self.last_transaction_count,
                current,
            });
        }
        self.last_transaction_count = current;
        Ok(())
    }

    /// Checks that the store and model contents are in sync.
    fn check_model(&self) -> Result<(), StoreInvariant> {
        let mut model_content = self.model.content().clone();
        for item in self.store.iter() {
            let key = item.key().to_string();
            let model_value = match model_content.remove(&key) {
                None => return Err(StoreInvariant::OnlyInStore { key }),
                Some(value) => value,
            };
            let value_size = item.value_size()?;
            let mut store_value = vec![0; value_size];
            item.get(&mut store_value, 0)?;
            if store_value != model_value {
                return Err(StoreInvariant::DifferentValue {
                    key,
                    store: store_value,
                    model: model_value,
                });
            }
        }
        if let Some(key) = model_content.keys().next() {
            return Err(StoreInvariant::OnlyInModel { key: key.clone() });
        }
        Ok(())
    }

    /// Checks the free-sector invariant and the sector accounting identity.
    fn check_accounting(&self) -> Result<(), StoreInvariant> {
        let store = &self.store;
        let sector_size = self.config.buffer.sector_size_bytes;
        let sectors = store.sector_descriptors();

        if !sectors.iter().any(|sector| sector.empty(sector_size)) {
            return Err(StoreInvariant::NoFreeSector);
        }

        // Recompute each sector's valid bytes from the descriptor table.
        let mut actual_valid = vec![0usize; sectors.len()];
        let cache = store.entry_cache();
        for index in 0..cache.len() {
            let mut seen_sectors = Vec::new();
            for &address in cache.addresses(index) {
                let sector = address as usize / sector_size;
                if seen_sectors.contains(&sector) {
                    return Err(StoreInvariant::RedundantCopiesInSameSector {
                        hash: cache.descriptor(index).hash(),
                        sector,
                    });
                }
                seen_sectors.push(sector);
                actual_valid[sector] += store.entry_size_at(address)?;
            }
        }
        for (sector, descriptor) in sectors.iter().enumerate() {
            if descriptor.valid_bytes() != actual_valid[sector] {
                return Err(StoreInvariant::SectorAccounting {
                    sector,
                    tracked: descriptor.valid_bytes(),
                    actual: actual_valid[sector],
                });
            }
        }
        Ok(())
    }
}

fn apply_to_store(store: &mut DriverStore, operation: &StoreOperation) -> StoreResult<()> {
    match operation {
        StoreOperation::Put { key, value } => store.put(key, value),
        StoreOperation::Delete { key } => store.delete(key),
        StoreOperation::GarbageCollect => store.garbage_collect_full(),
    }
}
