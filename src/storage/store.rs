// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, RwLock};

use crate::exchange::error::ExchangeError;
use crate::exchange::wire::Throttler;
use crate::icehouse_logging::info;
use crate::storage::disk::{Disk, DiskType};
use crate::storage::part::{DataPart, PartInfo, TtlInfos, Volume};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartState {
    PreCommitted,
    Committed,
    Outdated,
}

/// Space claim on a chosen disk. Accounting beyond disk choice is handled
/// by the surrounding engine.
pub struct Reservation {
    pub disk: Arc<Disk>,
}

/// Storage-engine facade the part exchange talks to: part lookup by state,
/// old versions for incremental fetch, disk reservations, broken-part
/// reports and the per-table send counter.
pub struct PartStore {
    table: String,
    relative_data_path: String,
    disks: Vec<Arc<Disk>>,
    parts: RwLock<BTreeMap<String, (PartState, Arc<DataPart>)>>,
    old_parts: RwLock<BTreeMap<String, Arc<DataPart>>>,
    pub current_table_sends: AtomicU32,
    broken_parts: Mutex<Vec<String>>,
    sends_throttler: Option<Arc<Throttler>>,
}

impl PartStore {
    pub fn new(table: impl Into<String>, relative_data_path: impl Into<String>, disks: Vec<Arc<Disk>>) -> Self {
        Self {
            table: table.into(),
            relative_data_path: relative_data_path.into(),
            disks,
            parts: RwLock::new(BTreeMap::new()),
            old_parts: RwLock::new(BTreeMap::new()),
            current_table_sends: AtomicU32::new(0),
            broken_parts: Mutex::new(Vec::new()),
            sends_throttler: None,
        }
    }

    pub fn with_sends_throttler(mut self, throttler: Arc<Throttler>) -> Self {
        self.sends_throttler = Some(throttler);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn relative_data_path(&self) -> &str {
        &self.relative_data_path
    }

    pub fn disks(&self) -> &[Arc<Disk>] {
        &self.disks
    }

    pub fn disks_by_type(&self, kind: DiskType) -> Vec<Arc<Disk>> {
        self.disks
            .iter()
            .filter(|d| d.disk_type() == kind)
            .cloned()
            .collect()
    }

    pub fn sends_throttler(&self) -> Option<&Arc<Throttler>> {
        self.sends_throttler.as_ref()
    }

    pub fn get_part_if_exists(&self, name: &str, states: &[PartState]) -> Option<Arc<DataPart>> {
        let parts = self.parts.read().expect("parts lock");
        parts.get(name).and_then(|(state, part)| {
            states.contains(state).then(|| Arc::clone(part))
        })
    }

    pub fn data_parts_vector(&self) -> Vec<Arc<DataPart>> {
        let parts = self.parts.read().expect("parts lock");
        parts
            .values()
            .filter(|(state, _)| *state == PartState::Committed)
            .map(|(_, part)| Arc::clone(part))
            .collect()
    }

    pub fn data_parts_in_partition(&self, partition_id: &str) -> Vec<Arc<DataPart>> {
        self.data_parts_vector()
            .into_iter()
            .filter(|part| part.info.partition_id == partition_id)
            .collect()
    }

    /// Server-evaluated list predicate. The expression surface is small:
    /// `partition_id = '<id>'` or `name = '<part>'`.
    pub fn parts_by_predicate(&self, filter: &str) -> Result<Vec<Arc<DataPart>>, ExchangeError> {
        let parse = || -> Option<(&str, &str)> {
            let (column, value) = filter.split_once('=')?;
            let value = value.trim().strip_prefix('\'')?.strip_suffix('\'')?;
            Some((column.trim(), value))
        };
        let Some((column, value)) = parse() else {
            return Err(ExchangeError::Validation(format!(
                "failed to parse filter of fetch list: {}",
                filter
            )));
        };
        match column {
            "partition_id" => Ok(self.data_parts_in_partition(value)),
            "name" => Ok(self
                .data_parts_vector()
                .into_iter()
                .filter(|part| part.name == value)
                .collect()),
            other => Err(ExchangeError::Validation(format!(
                "unsupported filter column: {}",
                other
            ))),
        }
    }

    pub fn add_part(&self, part: DataPart, state: PartState) -> Arc<DataPart> {
        let part = Arc::new(part);
        self.parts
            .write()
            .expect("parts lock")
            .insert(part.name.clone(), (state, Arc::clone(&part)));
        part
    }

    /// Keep a superseded version of a part around as the hard-link source
    /// for incremental fetches.
    pub fn add_old_version_part(&self, part: Arc<DataPart>) {
        self.old_parts
            .write()
            .expect("old parts lock")
            .insert(part.name.clone(), part);
    }

    pub fn get_old_version_part_if_exists(&self, name: &str) -> Option<Arc<DataPart>> {
        self.old_parts.read().expect("old parts lock").get(name).cloned()
    }

    pub fn report_broken_part(&self, name: &str) {
        info!("reporting broken part {}", name);
        self.broken_parts
            .lock()
            .expect("broken parts lock")
            .push(name.to_string());
    }

    pub fn broken_parts(&self) -> Vec<String> {
        self.broken_parts.lock().expect("broken parts lock").clone()
    }

    /// TTL-aware reservation: among disks with enough space, pick the one
    /// with the most room. TTL moves beyond disk choice are out of scope.
    pub fn reserve_space_preferring_ttl_rules(
        &self,
        size: u64,
        _ttl_infos: &TtlInfos,
    ) -> Option<Reservation> {
        self.disks
            .iter()
            .filter(|d| d.available_space() >= size)
            .max_by_key(|d| d.available_space())
            .map(|disk| Reservation {
                disk: Arc::clone(disk),
            })
    }

    pub fn make_empty_reservation_on_largest_disk(&self) -> Option<Reservation> {
        self.disks
            .iter()
            .max_by_key(|d| d.available_space())
            .map(|disk| Reservation {
                disk: Arc::clone(disk),
            })
    }

    pub fn full_path_on_disk(&self, disk: &Arc<Disk>) -> PathBuf {
        disk.path().join(&self.relative_data_path)
    }

    pub fn create_part(
        &self,
        name: &str,
        volume: &Arc<Volume>,
        relative_path: &str,
    ) -> Result<DataPart, ExchangeError> {
        DataPart::load(volume, relative_path, name)
    }

    /// Promote a fetched `tmp-fetch_` directory to its final name and
    /// register the part as committed.
    pub fn commit_fetched_part(&self, part: DataPart) -> Result<Arc<DataPart>, ExchangeError> {
        let info = PartInfo::from_part_name(&part.name)?;
        let disk = Arc::clone(part.disk());
        let final_relative = format!("{}/{}", self.relative_data_path, part.name);
        std::fs::rename(
            disk.absolute_path(&part.relative_path),
            disk.absolute_path(&final_relative),
        )?;
        let mut committed = DataPart::load(&part.volume, &final_relative, &part.name)?;
        committed.info = info;
        committed.is_temp = false;
        Ok(self.add_part(committed, PartState::Committed))
    }
}
