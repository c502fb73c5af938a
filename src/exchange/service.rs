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
//! Producer side of the part exchange: serves `FetchPart`, `FetchList` and
//! `checkExist` over one framed byte stream per request.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::config;
use crate::exchange::error::ExchangeError;
use crate::exchange::wire::{
    self, ActionBlocker, HashingWriter, copy_with_throttler,
};
use crate::exchange::{
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_DEFAULT_COMPRESSION,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_PROJECTION,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_S3_COPY,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE_AND_TTL_INFOS,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_TYPE, REPLICATION_PROTOCOL_VERSION_WITH_PARTS_UUID,
};
use crate::icehouse_logging::{trace, warn};
use crate::storage::checksums::{Checksum, Checksums};
use crate::storage::disk::DiskType;
use crate::storage::part::{
    CHECKSUMS_FILE_NAME, COLUMNS_FILE_NAME, COMPRESSION_DATA_FILE_EXTENSION,
    COMPRESSION_MARKS_FILE_EXTENSION, DEFAULT_COMPRESSION_CODEC_FILE_NAME, DataPart, PartInfo,
    PROJECTION_DIRECTORY_SUFFIX, block_to_ipc, is_map_implicit_file, map_file_from_implicit,
};
use crate::storage::store::{PartState, PartStore};

static TOTAL_SENDS: AtomicU32 = AtomicU32::new(0);

const FETCH_STATES: &[PartState] = &[
    PartState::PreCommitted,
    PartState::Committed,
    PartState::Outdated,
];

/// Response line the HTTP layer turns into status, headers and cookies.
#[derive(Debug)]
pub struct ResponseMeta {
    pub status: u16,
    pub reason: Option<String>,
    pub cookies: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self {
            status: 200,
            reason: None,
            cookies: Vec::new(),
            headers: Vec::new(),
        }
    }
}

struct SendsGuard<'a> {
    counter: &'a AtomicU32,
}

impl<'a> SendsGuard<'a> {
    fn acquire(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for SendsGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Service {
    store: Arc<PartStore>,
    pub blocker: ActionBlocker,
}

impl Service {
    pub fn new(store: Arc<PartStore>) -> Self {
        Self {
            store,
            blocker: ActionBlocker::new(),
        }
    }

    pub fn store(&self) -> &Arc<PartStore> {
        &self.store
    }

    pub fn process_query(
        &self,
        params: &HashMap<String, String>,
        body: &[u8],
        out: &mut Vec<u8>,
        response: &mut ResponseMeta,
    ) -> Result<(), ExchangeError> {
        let qtype = params.get("qtype").map(String::as_str).unwrap_or("FetchPart");
        match qtype {
            "FetchPart" => {
                let incrementally = params
                    .get("fetch_part_incrementally")
                    .map(String::as_str)
                    .unwrap_or("false")
                    == "true";
                self.process_query_part(params, body, out, response, incrementally)
            }
            "FetchList" => self.process_query_part_list(params, out),
            "checkExist" => self.process_query_exist(params, out),
            other => Err(ExchangeError::Logical(format!(
                "not support qtype: {}",
                other
            ))),
        }
    }

    fn param<'a>(
        params: &'a HashMap<String, String>,
        name: &str,
    ) -> Result<&'a str, ExchangeError> {
        params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ExchangeError::Validation(format!("missing parameter '{}'", name)))
    }

    fn process_query_part(
        &self,
        params: &HashMap<String, String>,
        body: &[u8],
        out: &mut Vec<u8>,
        response: &mut ResponseMeta,
        incrementally: bool,
    ) -> Result<(), ExchangeError> {
        let client_protocol_version: u32 = params
            .get("client_protocol_version")
            .map(String::as_str)
            .unwrap_or("0")
            .parse()
            .map_err(|e| ExchangeError::Validation(format!("bad client_protocol_version: {}", e)))?;

        let part_name = Self::param(params, "part")?.to_string();

        // Validation of the input that may come from a malicious replica.
        PartInfo::from_part_name(&part_name)?;

        let max_sends = config::replicated_max_parallel_sends();
        let max_table_sends = config::replicated_max_parallel_sends_for_table();
        if (max_sends != 0 && TOTAL_SENDS.load(Ordering::Acquire) >= max_sends)
            || (max_table_sends != 0
                && self.store.current_table_sends.load(Ordering::Acquire) >= max_table_sends)
        {
            response.status = 429;
            response.reason = Some("Too many concurrent fetches, try again later".to_string());
            response
                .headers
                .push(("Retry-After".to_string(), "10".to_string()));
            return Ok(());
        }

        // Pretend to be an older server when the client is, so it can parse us.
        let server_protocol_version =
            client_protocol_version.min(REPLICATION_PROTOCOL_VERSION_WITH_PARTS_PROJECTION);
        response.cookies.push((
            "server_protocol_version".to_string(),
            server_protocol_version.to_string(),
        ));
        if incrementally {
            response
                .cookies
                .push(("fetch_part_incrementally".to_string(), "true".to_string()));
        }

        let _total_guard = SendsGuard::acquire(&TOTAL_SENDS);
        let _table_guard = SendsGuard::acquire(&self.store.current_table_sends);

        trace!("sending part {}", part_name);

        let part = self.find_part(&part_name)?;

        let result = self.send_part(
            &part,
            params,
            body,
            out,
            response,
            client_protocol_version,
            incrementally,
        );
        if let Err(err) = &result {
            if !err.is_benign_for_sender() {
                let broken_name = part.parent_part.as_deref().unwrap_or(&part_name);
                self.store.report_broken_part(broken_name);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn send_part(
        &self,
        part: &DataPart,
        params: &HashMap<String, String>,
        body: &[u8],
        out: &mut Vec<u8>,
        response: &mut ResponseMeta,
        client_protocol_version: u32,
        incrementally: bool,
    ) -> Result<(), ExchangeError> {
        if client_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE {
            wire::write_u64(out, part.checksums.total_size_on_disk())?;
        }
        if client_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE_AND_TTL_INFOS {
            wire::write_bytes(out, &part.ttl_infos.serialized())?;
        }
        if client_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_TYPE {
            wire::write_string(out, part.part_type.as_str())?;
        }
        if client_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_UUID {
            wire::write_uuid_text(out, part.uuid)?;
        }

        let mut try_use_s3_copy = false;
        if config::allow_remote_fs_zero_copy_replication()
            && client_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_S3_COPY
        {
            // If both sides sit on the same object store, ship metadata only.
            let send_s3_metadata = params
                .get("send_s3_metadata")
                .map(String::as_str)
                .unwrap_or("0");
            if send_s3_metadata == "1" && part.disk().disk_type() == DiskType::S3 {
                try_use_s3_copy = true;
            }
        }

        if try_use_s3_copy {
            response
                .cookies
                .push(("send_s3_metadata".to_string(), "1".to_string()));
            self.send_part_s3_metadata(part, out)
        } else if client_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_PROJECTION {
            wire::write_u64(out, part.projections.len() as u64)?;
            if part.is_in_memory() {
                self.send_part_from_memory(part, out, true)
            } else {
                let old_checksums = self.parse_old_checksums(body, incrementally)?;
                self.send_part_from_disk(
                    part,
                    old_checksums.as_ref(),
                    out,
                    client_protocol_version,
                    true,
                )
                .map(|_| ())
            }
        } else if part.is_in_memory() {
            self.send_part_from_memory(part, out, false)
        } else {
            let old_checksums = self.parse_old_checksums(body, incrementally)?;
            self.send_part_from_disk(
                part,
                old_checksums.as_ref(),
                out,
                client_protocol_version,
                false,
            )
            .map(|_| ())
        }
    }

    fn parse_old_checksums(
        &self,
        body: &[u8],
        incrementally: bool,
    ) -> Result<Option<Checksums>, ExchangeError> {
        if !incrementally {
            return Ok(None);
        }
        let checksums =
            Checksums::from_serialized(body).map_err(|_| ExchangeError::ChecksumFormatTooOld)?;
        Ok(Some(checksums))
    }

    /// Only return local data parts.
    fn process_query_part_list(
        &self,
        params: &HashMap<String, String>,
        out: &mut Vec<u8>,
    ) -> Result<(), ExchangeError> {
        let filter = params.get("filter").map(String::as_str).unwrap_or("");

        let data_parts = if !filter.is_empty() {
            self.store.parts_by_predicate(filter)?
        } else {
            let partition_id = Self::param(params, "id")?;
            trace!("sending parts namelist");
            let parts = if partition_id == "all" {
                self.store.data_parts_vector()
            } else {
                self.store.data_parts_in_partition(partition_id)
            };
            parts
                .into_iter()
                .filter(|part| !part.info.is_fake_drop_range_part())
                .collect()
        };

        wire::write_u64(out, data_parts.len() as u64)?;
        for part in &data_parts {
            wire::write_string(out, &part.name)?;
        }
        Ok(())
    }

    fn process_query_exist(
        &self,
        params: &HashMap<String, String>,
        out: &mut Vec<u8>,
    ) -> Result<(), ExchangeError> {
        let part_name = Self::param(params, "part")?;
        let part = self.store.get_part_if_exists(part_name, FETCH_STATES);
        wire::write_u8(out, if part.is_some() { b'Y' } else { b'N' })?;
        Ok(())
    }

    fn send_part_from_memory(
        &self,
        part: &DataPart,
        out: &mut Vec<u8>,
        send_projections: bool,
    ) -> Result<(), ExchangeError> {
        if send_projections {
            for (name, projection) in &part.projections {
                let Some(block) = &projection.block else {
                    return Err(ExchangeError::Logical(format!(
                        "projection {} of part {} is not stored in memory",
                        name, part.name
                    )));
                };
                wire::write_string(out, name)?;
                projection.checksums.write(out)?;
                wire::write_bytes(out, &block_to_ipc(block)?)?;
            }
        }

        let Some(block) = &part.block else {
            return Err(ExchangeError::Logical(format!(
                "part {} is not stored in memory",
                part.name
            )));
        };
        part.checksums.write(out)?;
        let ipc = block_to_ipc(block)?;
        wire::write_bytes(out, &ipc)?;

        if let Some(throttler) = self.store.sends_throttler() {
            throttler.add(ipc.len() as u64);
        }
        Ok(())
    }

    fn send_part_from_disk(
        &self,
        part: &DataPart,
        old_checksums: Option<&Checksums>,
        out: &mut Vec<u8>,
        client_protocol_version: u32,
        send_projections: bool,
    ) -> Result<Checksums, ExchangeError> {
        // We'll take the list of files from the manifest, plus the files
        // whose presence alone is tracked.
        let mut checksums = part.checksums.clone();
        for file_name in part.file_names_without_checksums() {
            if client_protocol_version < REPLICATION_PROTOCOL_VERSION_WITH_PARTS_DEFAULT_COMPRESSION
                && file_name == DEFAULT_COMPRESSION_CODEC_FILE_NAME
            {
                continue;
            }
            checksums.files.insert(file_name.clone(), Checksum::default());
        }

        let disk = part.disk();
        let mut data_checksums = Checksums::new();
        for (name, projection) in &part.projections {
            let projection_entry = format!("{}{}", name, PROJECTION_DIRECTORY_SUFFIX);
            checksums.files.remove(&projection_entry);
            if send_projections {
                wire::write_string(out, name)?;
                let projection_checksums = self.send_part_from_disk(
                    projection,
                    None,
                    out,
                    client_protocol_version,
                    false,
                )?;
                data_checksums.add_file(
                    projection_entry,
                    projection_checksums.total_size_on_disk(),
                    projection_checksums.total_checksum_u128(),
                );
            } else if let Some(our_checksum) = part.checksums.files.get(&projection_entry) {
                // Not sending this projection; fold our entry so the final
                // self-check still balances.
                data_checksums.add_file(
                    projection_entry,
                    our_checksum.file_size,
                    our_checksum.file_hash,
                );
            }
        }

        // The receiver needs to know the parameter.
        let enable_compact_map_data = part.enable_compact_map_data;

        let mut skip_copy_checksums = Checksums::new();
        checksums.files.retain(|file_name, entry| {
            // Do not send recoded compression data; it is re-derivable, and a
            // half-recoded part must stay distinguishable from a broken one.
            if file_name.ends_with(COMPRESSION_DATA_FILE_EXTENSION)
                || file_name.ends_with(COMPRESSION_MARKS_FILE_EXTENSION)
            {
                data_checksums.add_file(file_name.clone(), entry.file_size, entry.file_hash);
                return false;
            }
            if enable_compact_map_data && is_map_implicit_file(file_name) {
                return true;
            }
            // Unchanged files hard-link on the fetcher instead of travelling.
            if let Some(old) = old_checksums {
                if file_name != CHECKSUMS_FILE_NAME
                    && file_name != COLUMNS_FILE_NAME
                    && part.checksums.is_equal(old, file_name)
                {
                    skip_copy_checksums.files.insert(file_name.clone(), entry.clone());
                    return false;
                }
            }
            true
        });

        wire::write_u64(out, checksums.files.len() as u64)?;
        wire::write_bool(out, enable_compact_map_data)?;

        let mut checksums_vector: Vec<(String, Checksum)> = checksums
            .files
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if enable_compact_map_data {
            // All implicit columns of a map column must travel in file order.
            checksums_vector.sort_by_key(|(_, checksum)| checksum.file_offset.unwrap_or(0));
        }

        if old_checksums.is_some() {
            wire::write_u64(out, skip_copy_checksums.files.len() as u64)?;
            for (file_name, checksum) in &skip_copy_checksums.files {
                wire::write_string(out, file_name)?;
                wire::write_u64(out, checksum.file_size)?;
                wire::write_u128(out, checksum.file_hash)?;
                if self.blocker.is_cancelled() {
                    return Err(ExchangeError::Aborted);
                }
                if file_name != CHECKSUMS_FILE_NAME && file_name != COLUMNS_FILE_NAME {
                    data_checksums.add_file(
                        file_name.clone(),
                        checksum.file_size,
                        checksum.file_hash,
                    );
                }
            }
        }

        let part_path = part.full_relative_path();
        for (file_name, entry) in &checksums_vector {
            let (path, size) = if enable_compact_map_data && is_map_implicit_file(file_name) {
                (
                    part_path.join(map_file_from_implicit(file_name)),
                    entry.file_size,
                )
            } else {
                let path = part_path.join(file_name);
                let size = disk.file_size(&path)?;
                (path, size)
            };

            wire::write_string(out, file_name)?;
            wire::write_u64(out, size)?;

            let mut hashing_out = HashingWriter::new(&mut *out);
            let mut file_in = disk.read_file(&path)?;
            if enable_compact_map_data && is_map_implicit_file(file_name) {
                let offset = entry.file_offset.unwrap_or(0);
                std::io::copy(&mut file_in.as_mut().take(offset), &mut std::io::sink())?;
                copy_with_throttler(
                    &mut file_in.take(size),
                    &mut hashing_out,
                    Some(size),
                    &self.blocker,
                    self.store.sends_throttler().map(Arc::as_ref),
                )?;
            } else {
                copy_with_throttler(
                    &mut file_in,
                    &mut hashing_out,
                    None,
                    &self.blocker,
                    self.store.sends_throttler().map(Arc::as_ref),
                )?;
            }

            if self.blocker.is_cancelled() {
                return Err(ExchangeError::Aborted);
            }

            if hashing_out.count() != size {
                return Err(ExchangeError::BadSizeOfFile(path.display().to_string()));
            }

            let count = hashing_out.count();
            let hash = hashing_out.hash();
            wire::write_u128(out, hash)?;

            if !part.file_names_without_checksums().contains(file_name) {
                data_checksums.add_file(file_name.clone(), count, hash);
            }
        }

        part.checksums.check_equal(&data_checksums, false)?;
        Ok(data_checksums)
    }

    fn send_part_s3_metadata(
        &self,
        part: &DataPart,
        out: &mut Vec<u8>,
    ) -> Result<(), ExchangeError> {
        let mut checksums = part.checksums.clone();
        for file_name in part.file_names_without_checksums() {
            checksums.files.insert(file_name.clone(), Checksum::default());
        }

        let disk = part.disk();
        if disk.disk_type() != DiskType::S3 {
            return Err(ExchangeError::Logical(
                "S3 disk is not S3 anymore".to_string(),
            ));
        }

        let part_id = part.get_unique_id()?;
        disk.lock_shared_data(&part_id, &part.name)?;
        wire::write_string(out, &part_id)?;

        wire::write_u64(out, checksums.files.len() as u64)?;
        let part_path = part.full_relative_path();
        for file_name in checksums.files.keys() {
            let metadata = disk
                .read_metadata(part_path.join(file_name))
                .map_err(|e| {
                    ExchangeError::Corrupted(format!(
                        "S3 metadata '{}' is not readable: {}",
                        file_name, e
                    ))
                })?;

            wire::write_string(out, file_name)?;
            wire::write_u64(out, metadata.len() as u64)?;

            let mut hashing_out = HashingWriter::new(&mut *out);
            copy_with_throttler(
                &mut std::io::Cursor::new(&metadata),
                &mut hashing_out,
                None,
                &self.blocker,
                self.store.sends_throttler().map(Arc::as_ref),
            )?;

            if hashing_out.count() != metadata.len() as u64 {
                return Err(ExchangeError::BadSizeOfFile(file_name.clone()));
            }
            let hash = hashing_out.hash();
            wire::write_u128(out, hash)?;
        }
        Ok(())
    }

    fn find_part(&self, name: &str) -> Result<Arc<DataPart>, ExchangeError> {
        // PreCommitted and Outdated parts are included: a remote replica
        // cannot know our local state, and such queries are normal.
        if let Some(part) = self.store.get_part_if_exists(name, FETCH_STATES) {
            return Ok(part);
        }
        warn!("no part {} in table", name);
        Err(ExchangeError::NoSuchPart(name.to_string()))
    }
}
