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
//! Consumer side of the part exchange: requests a part, streams its files
//! into a `tmp-fetch_` directory (or memory, or object-store metadata),
//! verifies every hash and hands the finished part to the store.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::common::config;
use crate::common::types::UniqueId;
use crate::exchange::error::{ExchangeError, FetchError, FetchStage, StageExt};
use crate::exchange::wire::{self, ActionBlocker, HashingWriter, Throttler, copy_with_throttler};
use crate::exchange::{
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_PROJECTION,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_S3_COPY, REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE_AND_TTL_INFOS,
    REPLICATION_PROTOCOL_VERSION_WITH_PARTS_TYPE, REPLICATION_PROTOCOL_VERSION_WITH_PARTS_UUID,
    endpoint_id,
};
use crate::icehouse_logging::{info, warn};
use crate::storage::checksums::Checksums;
use crate::storage::disk::{Disk, DiskType, WriteMode, normalize_path};
use crate::storage::part::{
    CHECKSUMS_FILE_NAME, COLUMNS_FILE_NAME, COMPRESSION_DATA_FILE_EXTENSION,
    COMPRESSION_MARKS_FILE_EXTENSION, DEFAULT_COMPRESSION_CODEC_FILE_NAME, DataPart,
    PROJECTION_DIRECTORY_SUFFIX, PartInfo, PartType, TtlInfos, Volume, build_in_memory_part,
    hash_manifest_of_block, ipc_to_block, is_map_implicit_file, map_file_from_implicit,
};
use crate::storage::store::PartStore;

const TMP_PREFIX: &str = "tmp-fetch_";

/// One fetch request; mirrors the query parameters of the exchange endpoint.
pub struct FetchPartRequest<'a> {
    pub part_name: &'a str,
    pub replica_path: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub user: &'a str,
    pub password: &'a str,
    pub interserver_scheme: &'a str,
    pub to_detached: bool,
    pub tmp_prefix: &'a str,
    pub try_use_s3_copy: bool,
    pub incrementally: bool,
}

pub struct Fetcher {
    store: Arc<PartStore>,
    pub blocker: ActionBlocker,
    client: reqwest::blocking::Client,
    throttler: Option<Arc<Throttler>>,
}

fn http_error(e: reqwest::Error) -> ExchangeError {
    ExchangeError::Network(std::io::Error::other(e))
}

fn illegal_name_component(name: &str) -> bool {
    name.is_empty() || name.contains('/') || name.contains('.')
}

impl Fetcher {
    pub fn new(store: Arc<PartStore>) -> Self {
        let mut builder = reqwest::blocking::Client::builder().cookie_store(true);
        let max_fetches_for_host = config::replicated_max_parallel_fetches_for_host();
        if max_fetches_for_host != 0 {
            builder = builder.pool_max_idle_per_host(max_fetches_for_host as usize);
        }
        Self {
            store,
            blocker: ActionBlocker::new(),
            client: builder.build().expect("build http client"),
            throttler: None,
        }
    }

    pub fn with_throttler(mut self, throttler: Arc<Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    fn throttler(&self) -> Option<&Throttler> {
        self.throttler.as_deref()
    }

    pub fn fetch_part(&self, request: &FetchPartRequest<'_>) -> Result<DataPart, FetchError> {
        if self.blocker.is_cancelled() {
            return Err(FetchError::new(FetchStage::Admission, ExchangeError::Aborted));
        }

        // Validation of the input that may come from a malicious replica.
        let part_info =
            PartInfo::from_part_name(request.part_name).at_stage(FetchStage::Admission)?;

        let mut old_version_part = None;
        if request.incrementally {
            old_version_part = self.store.get_old_version_part_if_exists(request.part_name);
        }

        let mut try_use_s3_copy = request.try_use_s3_copy;
        if !config::allow_remote_fs_zero_copy_replication() {
            try_use_s3_copy = false;
        }
        let mut disks_s3 = Vec::new();
        if try_use_s3_copy {
            disks_s3 = self.store.disks_by_type(DiskType::S3);
            if disks_s3.is_empty() {
                try_use_s3_copy = false;
            }
        }

        let mut uri = url::Url::parse(&format!(
            "{}://{}:{}/",
            request.interserver_scheme, request.host, request.port
        ))
        .map_err(|e| {
            FetchError::new(
                FetchStage::Admission,
                ExchangeError::Validation(format!("bad fetch url: {}", e)),
            )
        })?;
        uri.query_pairs_mut()
            .append_pair("endpoint", &endpoint_id(request.replica_path))
            .append_pair("part", request.part_name)
            .append_pair(
                "client_protocol_version",
                &REPLICATION_PROTOCOL_VERSION_WITH_PARTS_PROJECTION.to_string(),
            )
            .append_pair("compress", "false")
            .append_pair(
                "fetch_part_incrementally",
                if old_version_part.is_some() { "true" } else { "false" },
            );
        if try_use_s3_copy {
            uri.query_pairs_mut().append_pair("send_s3_metadata", "1");
        }

        let body = match &old_version_part {
            Some(old) => old.checksums.serialized(),
            None => Vec::new(),
        };

        let mut http_request = self.client.post(uri.clone()).body(body);
        if !request.user.is_empty() {
            http_request = http_request.basic_auth(request.user, Some(request.password));
        }
        let response = http_request
            .send()
            .map_err(http_error)
            .at_stage(FetchStage::Admission)?;

        if response.status().as_u16() == 429 {
            return Err(FetchError::new(
                FetchStage::Admission,
                ExchangeError::TooManySends,
            ));
        }
        if !response.status().is_success() {
            return Err(FetchError::new(
                FetchStage::Header,
                ExchangeError::Network(std::io::Error::other(format!(
                    "fetch of part {} failed with http status {}",
                    request.part_name,
                    response.status()
                ))),
            ));
        }

        let mut cookies = HashMap::new();
        for cookie in response.cookies() {
            cookies.insert(cookie.name().to_string(), cookie.value().to_string());
        }
        let server_protocol_version: u32 = cookies
            .get("server_protocol_version")
            .map(String::as_str)
            .unwrap_or("0")
            .parse()
            .map_err(|e| {
                FetchError::new(
                    FetchStage::Header,
                    ExchangeError::Corrupted(format!("bad server_protocol_version cookie: {}", e)),
                )
            })?;

        // The server may downgrade the incremental decision.
        let fetch_part_incrementally = cookies
            .get("fetch_part_incrementally")
            .map(String::as_str)
            .unwrap_or("false");
        if old_version_part.is_some() && fetch_part_incrementally == "false" {
            old_version_part = None;
        }

        let send_s3 = cookies.get("send_s3_metadata").map(String::as_str).unwrap_or("0");

        let mut input = response;

        if send_s3 == "1" {
            if server_protocol_version < REPLICATION_PROTOCOL_VERSION_WITH_PARTS_S3_COPY {
                return Err(FetchError::new(
                    FetchStage::Header,
                    ExchangeError::Logical(
                        "got 'send_s3_metadata' cookie with old protocol version".to_string(),
                    ),
                ));
            }
            if !try_use_s3_copy {
                return Err(FetchError::new(
                    FetchStage::Header,
                    ExchangeError::Logical(
                        "got 'send_s3_metadata' cookie when it was not requested".to_string(),
                    ),
                ));
            }

            let _sum_files_size = wire::read_u64(&mut input).at_stage(FetchStage::Header)?;
            let ttl_bytes = wire::read_bytes(&mut input).at_stage(FetchStage::Header)?;
            let _ttl_infos = TtlInfos::read(&ttl_bytes).at_stage(FetchStage::Header)?;

            let part_type_text = wire::read_string(&mut input).at_stage(FetchStage::Header)?;
            let part_type: PartType = part_type_text.parse().at_stage(FetchStage::Header)?;
            if part_type == PartType::InMemory {
                return Err(FetchError::new(
                    FetchStage::Header,
                    ExchangeError::IncorrectPartType(
                        "got 'send_s3_metadata' cookie for in-memory part".to_string(),
                    ),
                ));
            }

            if server_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_UUID {
                let _part_uuid = wire::read_uuid_text(&mut input).at_stage(FetchStage::Header)?;
            }

            match self.download_part_to_s3(
                request.part_name,
                request.to_detached,
                request.tmp_prefix,
                &disks_s3,
                &mut input,
            ) {
                Ok(part) => return Ok(part),
                Err(err) if matches!(err.source, ExchangeError::ObjectStore(_)) => {
                    // Zero-copy did not work out; repeat the fetch moving bytes.
                    warn!(
                        "zero-copy fetch of part {} failed ({}), retrying in normal mode",
                        request.part_name, err
                    );
                    let retry = FetchPartRequest {
                        try_use_s3_copy: false,
                        ..*request
                    };
                    return self.fetch_part(&retry);
                }
                Err(err) => return Err(err),
            }
        }

        let mut reservation = None;
        let mut sum_files_size = 0u64;
        if server_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE {
            sum_files_size = wire::read_u64(&mut input).at_stage(FetchStage::Header)?;
            if server_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE_AND_TTL_INFOS
            {
                let ttl_bytes = wire::read_bytes(&mut input).at_stage(FetchStage::Header)?;
                let ttl_infos = TtlInfos::read(&ttl_bytes).at_stage(FetchStage::Header)?;
                reservation = self
                    .store
                    .reserve_space_preferring_ttl_rules(sum_files_size, &ttl_infos);
            }
        }
        let reservation = match reservation {
            Some(reservation) => reservation,
            None => self
                .store
                .make_empty_reservation_on_largest_disk()
                .ok_or_else(|| {
                    FetchError::new(
                        FetchStage::Header,
                        ExchangeError::Logical("no disks to reserve on".to_string()),
                    )
                })?,
        };

        let min_fsync_bytes = config::min_compressed_bytes_to_fsync_after_fetch();
        let sync = min_fsync_bytes != 0 && sum_files_size >= min_fsync_bytes;

        let mut part_type = PartType::Wide;
        if server_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_TYPE {
            let text = wire::read_string(&mut input).at_stage(FetchStage::Header)?;
            part_type = text.parse().at_stage(FetchStage::Header)?;
        }

        let mut part_uuid = UniqueId::NIL;
        if server_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_UUID {
            part_uuid = wire::read_uuid_text(&mut input).at_stage(FetchStage::Header)?;
        }

        let mut projections = 0u64;
        if server_protocol_version >= REPLICATION_PROTOCOL_VERSION_WITH_PARTS_PROJECTION {
            projections = wire::read_u64(&mut input).at_stage(FetchStage::Header)?;
        }

        if part_type == PartType::InMemory {
            self.download_part_to_memory(
                request.part_name,
                part_uuid,
                part_info,
                &reservation.disk,
                &mut input,
                projections,
            )
        } else {
            self.download_part_to_disk(
                request.part_name,
                request.to_detached,
                request.tmp_prefix,
                sync,
                &reservation.disk,
                &mut input,
                projections,
                old_version_part.as_deref(),
            )
        }
    }

    pub fn fetch_part_list(
        &self,
        partition_id: &str,
        filter: &str,
        endpoint: &str,
        host: &str,
        port: u16,
        interserver_scheme: &str,
    ) -> Result<Vec<String>, FetchError> {
        let mut uri = url::Url::parse(&format!("{}://{}:{}/", interserver_scheme, host, port))
            .map_err(|e| {
                FetchError::new(
                    FetchStage::Admission,
                    ExchangeError::Validation(format!("bad fetch url: {}", e)),
                )
            })?;
        uri.query_pairs_mut()
            .append_pair("qtype", "FetchList")
            .append_pair("endpoint", &endpoint_id(endpoint))
            .append_pair("id", partition_id)
            .append_pair("filter", filter)
            .append_pair("compress", "false");

        let response = self
            .client
            .post(uri)
            .send()
            .map_err(http_error)
            .at_stage(FetchStage::Admission)?;
        if !response.status().is_success() {
            return Err(FetchError::new(
                FetchStage::Header,
                ExchangeError::Network(std::io::Error::other(format!(
                    "fetch list failed with http status {}",
                    response.status()
                ))),
            ));
        }

        let mut input = response;
        let num_parts = wire::read_u64(&mut input).at_stage(FetchStage::Body)?;
        let mut names = Vec::with_capacity(num_parts.min(1 << 20) as usize);
        for _ in 0..num_parts {
            names.push(wire::read_string(&mut input).at_stage(FetchStage::Body)?);
        }
        Ok(names)
    }

    pub fn check_part_exists(
        &self,
        part_name: &str,
        endpoint: &str,
        host: &str,
        port: u16,
        interserver_scheme: &str,
    ) -> Result<bool, FetchError> {
        let mut uri = url::Url::parse(&format!("{}://{}:{}/", interserver_scheme, host, port))
            .map_err(|e| {
                FetchError::new(
                    FetchStage::Admission,
                    ExchangeError::Validation(format!("bad fetch url: {}", e)),
                )
            })?;
        uri.query_pairs_mut()
            .append_pair("qtype", "checkExist")
            .append_pair("endpoint", &endpoint_id(endpoint))
            .append_pair("part", part_name)
            .append_pair("compress", "false");

        let response = self
            .client
            .post(uri)
            .send()
            .map_err(http_error)
            .at_stage(FetchStage::Admission)?;
        let mut input = response;
        let byte = wire::read_u8(&mut input).at_stage(FetchStage::Body)?;
        Ok(byte == b'Y')
    }

    #[allow(clippy::too_many_arguments)]
    fn download_part_to_disk(
        &self,
        part_name: &str,
        to_detached: bool,
        tmp_prefix: &str,
        sync: bool,
        disk: &Arc<Disk>,
        input: &mut impl Read,
        projections: u64,
        old_version_part: Option<&DataPart>,
    ) -> Result<DataPart, FetchError> {
        let tmp_prefix = if tmp_prefix.is_empty() { TMP_PREFIX } else { tmp_prefix };

        // The directory is removed if it already exists; that must never be
        // able to point anywhere else.
        if tmp_prefix.contains(['/', '.']) || part_name.contains(['/', '.']) {
            return Err(FetchError::new(
                FetchStage::Header,
                ExchangeError::Validation(
                    "tmp_prefix and part_name cannot be empty or contain '.' or '/'".to_string(),
                ),
            ));
        }

        let part_relative_path = format!(
            "{}{}{}",
            if to_detached { "detached/" } else { "" },
            tmp_prefix,
            part_name
        );
        let part_download_path = format!(
            "{}/{}",
            self.store.relative_data_path(),
            part_relative_path
        );

        if disk.exists(&part_download_path) {
            warn!(
                "directory {} already exists, probably result of a failed fetch; removing it",
                part_download_path
            );
            disk.remove_recursive(&part_download_path)
                .map_err(ExchangeError::from)
                .at_stage(FetchStage::Header)?;
        }
        disk.create_directories(&part_download_path)
            .map_err(ExchangeError::from)
            .at_stage(FetchStage::Header)?;

        let result = self.download_part_files(
            part_name,
            &part_download_path,
            sync,
            disk,
            input,
            projections,
            old_version_part,
        );
        if result.is_err() {
            let _ = disk.remove_recursive(&part_download_path);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn download_part_files(
        &self,
        part_name: &str,
        part_download_path: &str,
        sync: bool,
        disk: &Arc<Disk>,
        input: &mut impl Read,
        projections: u64,
        old_version_part: Option<&DataPart>,
    ) -> Result<DataPart, FetchError> {
        let mut checksums = Checksums::new();
        for _ in 0..projections {
            let projection_name = wire::read_string(input).at_stage(FetchStage::Body)?;
            if illegal_name_component(&projection_name) {
                return Err(FetchError::new(
                    FetchStage::Body,
                    ExchangeError::Validation(format!(
                        "illegal projection name '{}'",
                        projection_name
                    )),
                ));
            }
            let projection_path = format!(
                "{}/{}{}",
                part_download_path, projection_name, PROJECTION_DIRECTORY_SUFFIX
            );
            disk.create_directories(&projection_path)
                .map_err(ExchangeError::from)
                .at_stage(FetchStage::Body)?;
            let mut projection_checksums = Checksums::new();
            self.download_base_or_projection_part_to_disk(
                &projection_path,
                sync,
                disk,
                input,
                &mut projection_checksums,
                None,
            )?;
            checksums.add_file(
                format!("{}{}", projection_name, PROJECTION_DIRECTORY_SUFFIX),
                projection_checksums.total_size_on_disk(),
                projection_checksums.total_checksum_u128(),
            );
        }

        // Download the base part.
        self.download_base_or_projection_part_to_disk(
            part_download_path,
            sync,
            disk,
            input,
            &mut checksums,
            old_version_part,
        )?;

        wire::assert_eof(input).at_stage(FetchStage::Body)?;

        if config::fsync_part_directory() {
            disk.sync_directory(part_download_path)
                .map_err(ExchangeError::from)
                .at_stage(FetchStage::Finalize)?;
        }

        let volume = Volume::single_disk(format!("volume_{}", part_name), Arc::clone(disk));
        let mut new_data_part = self
            .store
            .create_part(part_name, &volume, part_download_path)
            .at_stage(FetchStage::Finalize)?;
        new_data_part.is_temp = true;

        // Recoded compression files never travel; their entries come from
        // the (hash-verified) manifest and are folded in before comparing.
        for (name, entry) in &new_data_part.checksums.files {
            if name.ends_with(COMPRESSION_DATA_FILE_EXTENSION)
                || name.ends_with(COMPRESSION_MARKS_FILE_EXTENSION)
            {
                checksums
                    .files
                    .entry(name.clone())
                    .or_insert_with(|| entry.clone());
            }
        }

        new_data_part
            .checksums
            .check_equal(&checksums, false)
            .at_stage(FetchStage::Finalize)?;
        if new_data_part.checksums.adjust_diff_implicit_key_offset(&checksums) {
            info!(
                "checksums have different implicit key offsets, rewriting checksums for part {}",
                new_data_part.name
            );
            // Rewriting the manifest is safe while the part is still a
            // download directory.
            let serialized = new_data_part.checksums.serialized();
            let mut out = disk
                .write_file(
                    Path::new(part_download_path).join(CHECKSUMS_FILE_NAME),
                    WriteMode::Rewrite,
                )
                .map_err(ExchangeError::from)
                .at_stage(FetchStage::Finalize)?;
            std::io::Write::write_all(&mut out, &serialized)
                .map_err(ExchangeError::from)
                .at_stage(FetchStage::Finalize)?;
            out.finalize().map_err(ExchangeError::from).at_stage(FetchStage::Finalize)?;
            if sync {
                out.sync().map_err(ExchangeError::from).at_stage(FetchStage::Finalize)?;
            }
        }

        Ok(new_data_part)
    }

    fn download_base_or_projection_part_to_disk(
        &self,
        part_download_path: &str,
        sync: bool,
        disk: &Arc<Disk>,
        input: &mut impl Read,
        checksums: &mut Checksums,
        old_version_part: Option<&DataPart>,
    ) -> Result<(), FetchError> {
        let files = wire::read_u64(input).at_stage(FetchStage::Body)?;
        let enable_compact_map_data = wire::read_bool(input).at_stage(FetchStage::Body)?;

        let download_root = normalize_path(&disk.absolute_path(part_download_path));

        if let Some(old_part) = old_version_part {
            let skip_copy_files = wire::read_u64(input).at_stage(FetchStage::Body)?;
            for _ in 0..skip_copy_files {
                let stream_name = wire::read_string(input).at_stage(FetchStage::Body)?;
                let file_size = wire::read_u64(input).at_stage(FetchStage::Body)?;
                let expected_hash = wire::read_u128(input).at_stage(FetchStage::Body)?;

                let destination =
                    normalize_path(&disk.absolute_path(Path::new(part_download_path).join(&stream_name)));
                if !destination.starts_with(&download_root) {
                    return Err(FetchError::new(
                        FetchStage::Body,
                        ExchangeError::InsecurePath {
                            path: destination.display().to_string(),
                            part_path: download_root.display().to_string(),
                        },
                    ));
                }
                let source = old_part
                    .disk()
                    .absolute_path(old_part.full_relative_path().join(&stream_name));
                disk.hard_link(&source, &destination)
                    .map_err(ExchangeError::from)
                    .at_stage(FetchStage::Body)?;

                if self.blocker.is_cancelled() {
                    return Err(FetchError::new(FetchStage::Body, ExchangeError::Aborted));
                }

                if stream_name != CHECKSUMS_FILE_NAME && stream_name != COLUMNS_FILE_NAME {
                    checksums.add_file(stream_name, file_size, expected_hash);
                }
            }
        }

        for _ in 0..files {
            let stream_name = wire::read_string(input).at_stage(FetchStage::Body)?;
            let file_size = wire::read_u64(input).at_stage(FetchStage::Body)?;

            // Implicit compact-map columns append to their shared file.
            let mut need_append = false;
            let mut file_name = stream_name.clone();
            if enable_compact_map_data && is_map_implicit_file(&stream_name) {
                need_append = true;
                file_name = map_file_from_implicit(&stream_name);
            }

            // The file must land inside the download directory; a malicious
            // replica must not be able to write anywhere else.
            let absolute_file_path =
                normalize_path(&disk.absolute_path(Path::new(part_download_path).join(&file_name)));
            if !absolute_file_path.starts_with(&download_root) {
                return Err(FetchError::new(
                    FetchStage::Body,
                    ExchangeError::InsecurePath {
                        path: absolute_file_path.display().to_string(),
                        part_path: download_root.display().to_string(),
                    },
                ));
            }

            // The local offset may differ from the sender's when map keys
            // were cleared on one side.
            let relative_file_path = Path::new(part_download_path).join(&file_name);
            let mut file_offset = 0u64;
            if need_append && disk.exists(&relative_file_path) {
                file_offset = disk
                    .file_size(&relative_file_path)
                    .map_err(ExchangeError::from)
                    .at_stage(FetchStage::Body)?;
            }

            let file_out = disk
                .write_file(
                    &relative_file_path,
                    if need_append { WriteMode::Append } else { WriteMode::Rewrite },
                )
                .map_err(ExchangeError::from)
                .at_stage(FetchStage::Body)?;
            let mut hashing_out = HashingWriter::new(file_out);
            copy_with_throttler(
                input,
                &mut hashing_out,
                Some(file_size),
                &self.blocker,
                self.throttler(),
            )
            .at_stage(FetchStage::Body)?;

            if self.blocker.is_cancelled() {
                return Err(FetchError::new(FetchStage::Body, ExchangeError::Aborted));
            }

            let expected_hash = wire::read_u128(input).at_stage(FetchStage::Body)?;
            if expected_hash != hashing_out.hash() {
                return Err(FetchError::new(
                    FetchStage::Body,
                    ExchangeError::ChecksumMismatch(stream_name),
                ));
            }

            let mut file_out = hashing_out.into_inner();
            file_out
                .finalize()
                .map_err(ExchangeError::from)
                .at_stage(FetchStage::Body)?;
            if sync {
                file_out
                    .sync()
                    .map_err(ExchangeError::from)
                    .at_stage(FetchStage::Body)?;
            }

            if stream_name != CHECKSUMS_FILE_NAME
                && stream_name != COLUMNS_FILE_NAME
                && stream_name != DEFAULT_COMPRESSION_CODEC_FILE_NAME
            {
                if need_append {
                    checksums.add_file_with_offset(stream_name, file_offset, file_size, expected_hash);
                } else {
                    checksums.add_file(stream_name, file_size, expected_hash);
                }
            }
        }
        Ok(())
    }

    fn download_part_to_memory(
        &self,
        part_name: &str,
        part_uuid: UniqueId,
        _part_info: PartInfo,
        disk: &Arc<Disk>,
        input: &mut impl Read,
        projections: u64,
    ) -> Result<DataPart, FetchError> {
        let volume = Volume::single_disk(format!("volume_{}", part_name), Arc::clone(disk));

        let mut projection_parts = BTreeMap::new();
        for _ in 0..projections {
            let projection_name = wire::read_string(input).at_stage(FetchStage::Body)?;
            let expected = Checksums::read(input).at_stage(FetchStage::Body)?;
            let ipc = wire::read_bytes(input).at_stage(FetchStage::Body)?;
            if let Some(throttler) = self.throttler() {
                throttler.add(ipc.len() as u64);
            }
            let block = ipc_to_block(&ipc).at_stage(FetchStage::Body)?;

            // Rebuild through the normal writer and verify what arrived.
            let rebuilt = hash_manifest_of_block(&block).at_stage(FetchStage::Finalize)?;
            rebuilt
                .check_equal(&expected, true)
                .at_stage(FetchStage::Finalize)?;

            let mut projection = build_in_memory_part(&volume, "all_0_0_0", UniqueId::NIL, block)
                .at_stage(FetchStage::Finalize)?;
            projection.name = projection_name.clone();
            projection.parent_part = Some(part_name.to_string());
            projection_parts.insert(projection_name, projection);
        }

        let expected = Checksums::read(input).at_stage(FetchStage::Body)?;
        let ipc = wire::read_bytes(input).at_stage(FetchStage::Body)?;
        if let Some(throttler) = self.throttler() {
            throttler.add(ipc.len() as u64);
        }
        let block = ipc_to_block(&ipc).at_stage(FetchStage::Body)?;

        let rebuilt = hash_manifest_of_block(&block).at_stage(FetchStage::Finalize)?;
        rebuilt
            .check_equal(&expected, true)
            .at_stage(FetchStage::Finalize)?;

        let mut new_data_part = build_in_memory_part(&volume, part_name, part_uuid, block)
            .at_stage(FetchStage::Finalize)?;
        new_data_part.is_temp = true;
        new_data_part.projections = projection_parts;
        Ok(new_data_part)
    }

    fn download_part_to_s3(
        &self,
        part_name: &str,
        to_detached: bool,
        tmp_prefix: &str,
        disks_s3: &[Arc<Disk>],
        input: &mut impl Read,
    ) -> Result<DataPart, FetchError> {
        if disks_s3.is_empty() {
            return Err(FetchError::new(
                FetchStage::Header,
                ExchangeError::Logical("no S3 disks anymore".to_string()),
            ));
        }

        let part_id = wire::read_string(input).at_stage(FetchStage::Header)?;

        let mut disk = Arc::clone(&disks_s3[0]);
        for disk_s3 in disks_s3 {
            if disk_s3.check_unique_id(&part_id) {
                disk = Arc::clone(disk_s3);
                break;
            }
        }

        let tmp_prefix = if tmp_prefix.is_empty() { TMP_PREFIX } else { tmp_prefix };
        if tmp_prefix.contains(['/', '.']) || part_name.contains(['/', '.']) {
            return Err(FetchError::new(
                FetchStage::Header,
                ExchangeError::Validation(
                    "tmp_prefix and part_name cannot be empty or contain '.' or '/'".to_string(),
                ),
            ));
        }
        let part_relative_path = format!(
            "{}{}{}",
            if to_detached { "detached/" } else { "" },
            tmp_prefix,
            part_name
        );
        let part_download_path = format!(
            "{}/{}",
            self.store.relative_data_path(),
            part_relative_path
        );

        if disk.exists(&part_download_path) {
            return Err(FetchError::new(
                FetchStage::Header,
                ExchangeError::DirectoryAlreadyExists(part_download_path),
            ));
        }
        disk.create_directories(&part_download_path)
            .map_err(ExchangeError::from)
            .at_stage(FetchStage::Header)?;

        let result =
            self.download_s3_metadata_files(part_name, &part_download_path, &disk, &part_id, input);
        if result.is_err() {
            let _ = disk.remove_recursive(&part_download_path);
        }
        result
    }

    fn download_s3_metadata_files(
        &self,
        part_name: &str,
        part_download_path: &str,
        disk: &Arc<Disk>,
        part_id: &str,
        input: &mut impl Read,
    ) -> Result<DataPart, FetchError> {
        let files = wire::read_u64(input).at_stage(FetchStage::Body)?;
        let download_root = normalize_path(&disk.absolute_path(part_download_path));

        for _ in 0..files {
            let file_name = wire::read_string(input).at_stage(FetchStage::Body)?;
            let file_size = wire::read_u64(input).at_stage(FetchStage::Body)?;

            let relative_file_path = Path::new(part_download_path).join(&file_name);
            let absolute_file_path = normalize_path(&disk.absolute_path(&relative_file_path));
            if !absolute_file_path.starts_with(&download_root) {
                return Err(FetchError::new(
                    FetchStage::Body,
                    ExchangeError::InsecurePath {
                        path: absolute_file_path.display().to_string(),
                        part_path: download_root.display().to_string(),
                    },
                ));
            }

            let mut metadata = Vec::new();
            let mut hashing_out = HashingWriter::new(&mut metadata);
            copy_with_throttler(
                input,
                &mut hashing_out,
                Some(file_size),
                &self.blocker,
                self.throttler(),
            )
            .at_stage(FetchStage::Body)?;

            let expected_hash = wire::read_u128(input).at_stage(FetchStage::Body)?;
            if expected_hash != hashing_out.hash() {
                return Err(FetchError::new(
                    FetchStage::Body,
                    ExchangeError::ChecksumMismatch(file_name),
                ));
            }

            // The metadata only makes sense if this disk can see the same
            // underlying object; otherwise fall back to a normal fetch.
            disk.write_metadata(&relative_file_path, &metadata)
                .map_err(|e| ExchangeError::ObjectStore(e.to_string()))
                .at_stage(FetchStage::Body)?;
        }

        wire::assert_eof(input).at_stage(FetchStage::Body)?;

        let volume = Volume::single_disk(format!("volume_{}", part_name), Arc::clone(disk));
        let mut new_data_part = self
            .store
            .create_part(part_name, &volume, part_download_path)
            .map_err(|e| ExchangeError::ObjectStore(e.to_string()))
            .at_stage(FetchStage::Finalize)?;
        new_data_part.is_temp = true;

        disk.lock_shared_data(part_id, part_name)
            .map_err(ExchangeError::from)
            .at_stage(FetchStage::Finalize)?;

        Ok(new_data_part)
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchStage, Fetcher};
    use crate::exchange::error::ExchangeError;
    use crate::exchange::wire;
    use crate::storage::disk::Disk;
    use crate::storage::store::PartStore;
    use std::io::Cursor;
    use std::sync::Arc;

    fn test_fetcher(root: &std::path::Path) -> (Fetcher, Arc<Disk>) {
        let disk = Arc::new(Disk::local("disk0", root));
        disk.create_directories("data").expect("create data dir");
        let store = Arc::new(PartStore::new("t", "data", vec![Arc::clone(&disk)]));
        (Fetcher::new(store), disk)
    }

    fn file_frame(name: &str, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_u64(&mut out, 1).expect("files count");
        wire::write_bool(&mut out, false).expect("compact flag");
        wire::write_string(&mut out, name).expect("name");
        wire::write_u64(&mut out, bytes.len() as u64).expect("size");
        out.extend_from_slice(bytes);
        wire::write_u128(&mut out, wire::hash_bytes(bytes)).expect("hash");
        out
    }

    #[test]
    fn traversal_filename_aborts_before_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (fetcher, disk) = test_fetcher(dir.path());

        for evil in ["../evil.bin", "../../etc/passwd", "/etc/passwd"] {
            let stream = file_frame(evil, b"data");
            let err = fetcher
                .download_part_to_disk(
                    "all_1_1_0",
                    false,
                    "",
                    false,
                    &disk,
                    &mut Cursor::new(stream),
                    0,
                    None,
                )
                .expect_err("must fail");
            assert_eq!(err.stage, FetchStage::Body, "{}", evil);
            assert!(
                matches!(err.source, ExchangeError::InsecurePath { .. }),
                "{}",
                evil
            );
            assert!(!disk.exists("data/tmp-fetch_all_1_1_0"));
        }
        assert!(!dir.path().join("evil.bin").exists());
    }

    #[test]
    fn cancelled_fetch_leaves_no_tmp_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (fetcher, disk) = test_fetcher(dir.path());
        fetcher.blocker.cancel();

        let stream = file_frame("a.bin", &[0u8; 4096]);
        let err = fetcher
            .download_part_to_disk(
                "all_1_1_0",
                false,
                "",
                false,
                &disk,
                &mut Cursor::new(stream),
                0,
                None,
            )
            .expect_err("must abort");
        assert!(matches!(err.source, ExchangeError::Aborted));
        assert!(!disk.exists("data/tmp-fetch_all_1_1_0"));
    }

    #[test]
    fn truncated_stream_fails_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (fetcher, disk) = test_fetcher(dir.path());

        let mut stream = Vec::new();
        wire::write_u64(&mut stream, 1).expect("files count");
        wire::write_bool(&mut stream, false).expect("compact flag");
        wire::write_string(&mut stream, "a.bin").expect("name");
        wire::write_u64(&mut stream, 1024).expect("size");
        stream.extend_from_slice(&[0u8; 16]); // far fewer bytes than promised

        let err = fetcher
            .download_part_to_disk(
                "all_1_1_0",
                false,
                "",
                false,
                &disk,
                &mut Cursor::new(stream),
                0,
                None,
            )
            .expect_err("must fail");
        assert_eq!(err.stage, FetchStage::Body);
        assert!(!disk.exists("data/tmp-fetch_all_1_1_0"));
    }

    #[test]
    fn dotted_tmp_prefix_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (fetcher, disk) = test_fetcher(dir.path());
        let err = fetcher
            .download_part_to_disk(
                "all_1_1_0",
                false,
                "../up_",
                false,
                &disk,
                &mut Cursor::new(Vec::new()),
                0,
                None,
            )
            .expect_err("must fail");
        assert!(matches!(err.source, ExchangeError::Validation(_)));
    }
}
