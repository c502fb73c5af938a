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
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::common::types::UniqueId;
use crate::exchange::error::ExchangeError;
use crate::exchange::wire::hash_bytes;
use crate::storage::checksums::Checksums;
use crate::storage::disk::{Disk, WriteMode};

pub const CHECKSUMS_FILE_NAME: &str = "checksums.txt";
pub const COLUMNS_FILE_NAME: &str = "columns.txt";
pub const UUID_FILE_NAME: &str = "uuid.txt";
pub const TTL_FILE_NAME: &str = "ttl.txt";
pub const DEFAULT_COMPRESSION_CODEC_FILE_NAME: &str = "default_compression_codec.txt";

pub const COMPRESSION_DATA_FILE_EXTENSION: &str = ".cdata";
pub const COMPRESSION_MARKS_FILE_EXTENSION: &str = ".cmrk";

pub const PROJECTION_DIRECTORY_SUFFIX: &str = ".proj";

const TTL_FORMAT_HEADER: &str = "ttl format version: 1\n";

/// Drop-range parts carry this level and never hold data.
const DROP_RANGE_LEVEL: u64 = 999_999_999;

/// Logical sub-column of a compact map: `m.__k1__.bin` lives inside the
/// shared physical file `m.bin` at its recorded offset.
pub fn is_map_implicit_file(name: &str) -> bool {
    name.contains(".__")
}

pub fn map_file_from_implicit(name: &str) -> String {
    let Some(idx) = name.find(".__") else {
        return name.to_string();
    };
    let prefix = &name[..idx];
    match name.rsplit_once('.') {
        Some((_, extension)) => format!("{}.{}", prefix, extension),
        None => prefix.to_string(),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartType {
    Wide,
    Compact,
    InMemory,
}

impl PartType {
    pub fn as_str(self) -> &'static str {
        match self {
            PartType::Wide => "Wide",
            PartType::Compact => "Compact",
            PartType::InMemory => "InMemory",
        }
    }
}

impl FromStr for PartType {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Wide" => Ok(PartType::Wide),
            "Compact" => Ok(PartType::Compact),
            "InMemory" => Ok(PartType::InMemory),
            other => Err(ExchangeError::IncorrectPartType(other.to_string())),
        }
    }
}

/// Parsed `<partition>_<min>_<max>_<level>` part name.
///
/// Parsing doubles as validation of names received from remote replicas.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u64,
}

impl PartInfo {
    pub fn from_part_name(name: &str) -> Result<PartInfo, ExchangeError> {
        let bad = || ExchangeError::Validation(format!("malformed part name '{}'", name));

        let pieces: Vec<&str> = name.split('_').collect();
        if pieces.len() < 4 {
            return Err(bad());
        }
        let level = pieces[pieces.len() - 1].parse().map_err(|_| bad())?;
        let max_block = pieces[pieces.len() - 2].parse().map_err(|_| bad())?;
        let min_block = pieces[pieces.len() - 3].parse().map_err(|_| bad())?;
        let partition_id = pieces[..pieces.len() - 3].join("_");
        if partition_id.is_empty()
            || !partition_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(bad());
        }
        if min_block > max_block {
            return Err(bad());
        }
        Ok(PartInfo {
            partition_id,
            min_block,
            max_block,
            level,
        })
    }

    pub fn is_fake_drop_range_part(&self) -> bool {
        self.level >= DROP_RANGE_LEVEL
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TtlInfos {
    pub part_min_ttl: i64,
    pub part_max_ttl: i64,
}

impl TtlInfos {
    pub fn write(&self, out: &mut impl Write) -> Result<(), ExchangeError> {
        out.write_all(TTL_FORMAT_HEADER.as_bytes())?;
        let body = serde_json::to_vec(self)
            .map_err(|e| ExchangeError::Logical(format!("serialize ttl infos: {}", e)))?;
        out.write_all(&body)?;
        Ok(())
    }

    pub fn serialized(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out).expect("serialize ttl infos to memory");
        out
    }

    pub fn read(bytes: &[u8]) -> Result<TtlInfos, ExchangeError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ExchangeError::Corrupted(format!("ttl infos are not utf-8: {}", e)))?;
        let Some(body) = text.strip_prefix(TTL_FORMAT_HEADER) else {
            return Err(ExchangeError::Corrupted(
                "ttl infos miss the format header".to_string(),
            ));
        };
        serde_json::from_str(body)
            .map_err(|e| ExchangeError::Corrupted(format!("bad ttl infos: {}", e)))
    }
}

/// Single-disk volume, the only kind the exchange deals with.
#[derive(Debug)]
pub struct Volume {
    pub name: String,
    pub disk: Arc<Disk>,
}

impl Volume {
    pub fn single_disk(name: impl Into<String>, disk: Arc<Disk>) -> Arc<Volume> {
        Arc::new(Volume {
            name: name.into(),
            disk,
        })
    }
}

pub fn block_to_ipc(block: &RecordBatch) -> Result<Vec<u8>, ExchangeError> {
    let mut buffer = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buffer, block.schema().as_ref())
        .map_err(|e| ExchangeError::Logical(format!("failed to create Arrow IPC writer: {e}")))?;
    writer
        .write(block)
        .map_err(|e| ExchangeError::Logical(format!("failed to write block: {e}")))?;
    writer
        .finish()
        .map_err(|e| ExchangeError::Logical(format!("failed to finish Arrow IPC writer: {e}")))?;
    Ok(buffer)
}

pub fn ipc_to_block(bytes: &[u8]) -> Result<RecordBatch, ExchangeError> {
    let mut cursor = Cursor::new(bytes);
    let reader = StreamReader::try_new(&mut cursor, None)
        .map_err(|e| ExchangeError::Corrupted(format!("failed to create Arrow IPC reader: {e}")))?;
    let mut block = None;
    for batch in reader {
        let batch =
            batch.map_err(|e| ExchangeError::Corrupted(format!("failed to read block: {e}")))?;
        if block.is_some() {
            return Err(ExchangeError::Corrupted(
                "in-memory part stream holds more than one block".to_string(),
            ));
        }
        block = Some(batch);
    }
    block.ok_or_else(|| ExchangeError::Corrupted("in-memory part stream is empty".to_string()))
}

/// File name of the single manifest entry of an in-memory part.
pub const IN_MEMORY_BLOCK_FILE_NAME: &str = "data.bin";

/// Manifest an in-memory part would carry for `block`; recomputed by the
/// receiver to verify what arrived.
pub fn hash_manifest_of_block(block: &RecordBatch) -> Result<Checksums, ExchangeError> {
    let ipc = block_to_ipc(block)?;
    let mut checksums = Checksums::new();
    checksums.add_file(IN_MEMORY_BLOCK_FILE_NAME, ipc.len() as u64, hash_bytes(&ipc));
    Ok(checksums)
}

/// Immutable columnar part: a directory of files plus its manifest, nested
/// projection parts, and (for in-memory parts) the block itself.
#[derive(Debug)]
pub struct DataPart {
    pub name: String,
    pub uuid: UniqueId,
    pub part_type: PartType,
    pub info: PartInfo,
    pub ttl_infos: TtlInfos,
    pub checksums: Checksums,
    pub files_without_checksums: BTreeSet<String>,
    pub projections: BTreeMap<String, DataPart>,
    pub volume: Arc<Volume>,
    /// Directory of the part, relative to the disk root.
    pub relative_path: String,
    pub enable_compact_map_data: bool,
    pub block: Option<RecordBatch>,
    pub is_temp: bool,
    /// Set on projection parts; names the containing part.
    pub parent_part: Option<String>,
}

impl DataPart {
    pub fn is_projection_part(&self) -> bool {
        self.parent_part.is_some()
    }

    pub fn is_in_memory(&self) -> bool {
        self.part_type == PartType::InMemory
    }

    pub fn disk(&self) -> &Arc<Disk> {
        &self.volume.disk
    }

    pub fn full_relative_path(&self) -> PathBuf {
        PathBuf::from(&self.relative_path)
    }

    pub fn file_names_without_checksums(&self) -> &BTreeSet<String> {
        &self.files_without_checksums
    }

    /// Object id backing this part on an object-store disk; used as the
    /// key of zero-copy ownership.
    pub fn get_unique_id(&self) -> Result<String, ExchangeError> {
        let first = self
            .checksums
            .files
            .keys()
            .find(|name| {
                !name.ends_with(COMPRESSION_DATA_FILE_EXTENSION)
                    && !name.ends_with(COMPRESSION_MARKS_FILE_EXTENSION)
            })
            .ok_or_else(|| ExchangeError::Logical("part has no files".to_string()))?;
        let bytes = self
            .disk()
            .read_metadata(self.full_relative_path().join(first))?;
        let metadata: crate::storage::disk::ObjectMetadata = serde_json::from_slice(&bytes)
            .map_err(|e| ExchangeError::Corrupted(format!("bad object metadata: {}", e)))?;
        Ok(metadata.object_id)
    }

    /// Load a part from its directory, reloading the manifest from
    /// `checksums.txt` and descending into `*.proj` sub-directories.
    pub fn load(
        volume: &Arc<Volume>,
        relative_path: &str,
        name: &str,
    ) -> Result<DataPart, ExchangeError> {
        Self::load_inner(volume, relative_path, name, None)
    }

    fn load_inner(
        volume: &Arc<Volume>,
        relative_path: &str,
        name: &str,
        parent_part: Option<String>,
    ) -> Result<DataPart, ExchangeError> {
        let disk = &volume.disk;
        let dir = PathBuf::from(relative_path);

        let checksums_bytes = disk.read_all(dir.join(CHECKSUMS_FILE_NAME))?;
        let checksums = Checksums::from_serialized(&checksums_bytes)?;

        let mut files_without_checksums = BTreeSet::new();
        for candidate in [
            CHECKSUMS_FILE_NAME,
            COLUMNS_FILE_NAME,
            DEFAULT_COMPRESSION_CODEC_FILE_NAME,
        ] {
            if disk.exists(dir.join(candidate)) {
                files_without_checksums.insert(candidate.to_string());
            }
        }

        let ttl_infos = if disk.exists(dir.join(TTL_FILE_NAME)) {
            TtlInfos::read(&disk.read_all(dir.join(TTL_FILE_NAME))?)?
        } else {
            TtlInfos::default()
        };

        let uuid = if disk.exists(dir.join(UUID_FILE_NAME)) {
            let text = String::from_utf8(disk.read_all(dir.join(UUID_FILE_NAME))?)
                .map_err(|e| ExchangeError::Corrupted(format!("uuid file is not utf-8: {}", e)))?;
            text.trim()
                .parse()
                .map_err(|e: String| ExchangeError::Corrupted(e))?
        } else {
            UniqueId::NIL
        };

        let mut projections = BTreeMap::new();
        for entry in disk.list_files(&dir)? {
            if let Some(projection_name) = entry.strip_suffix(PROJECTION_DIRECTORY_SUFFIX) {
                let projection_path = dir.join(&entry);
                let projection = Self::load_inner(
                    volume,
                    projection_path.to_str().ok_or_else(|| {
                        ExchangeError::Validation("non-utf8 projection path".to_string())
                    })?,
                    projection_name,
                    Some(name.to_string()),
                )?;
                projections.insert(projection_name.to_string(), projection);
            }
        }

        let enable_compact_map_data = checksums.files.keys().any(|n| is_map_implicit_file(n));
        let part_type = PartType::Wide;

        let info = match parent_part {
            // Projection parts reuse a fixed single-block range.
            Some(_) => PartInfo {
                partition_id: "all".to_string(),
                min_block: 0,
                max_block: 0,
                level: 0,
            },
            None => PartInfo::from_part_name(name)?,
        };

        Ok(DataPart {
            name: name.to_string(),
            uuid,
            part_type,
            info,
            ttl_infos,
            checksums,
            files_without_checksums,
            projections,
            volume: Arc::clone(volume),
            relative_path: relative_path.to_string(),
            enable_compact_map_data,
            block: None,
            is_temp: false,
            parent_part,
        })
    }
}

/// File fed to [`write_part`]. Implicit compact-map files append to their
/// shared physical file and record the offset they landed at.
pub struct PartFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl PartFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// The normal writer path: materialize files, then the manifest.
///
/// Used when creating parts locally and when rebuilding a fetched in-memory
/// part on disk.
pub fn write_part(
    volume: &Arc<Volume>,
    relative_path: &str,
    name: &str,
    uuid: UniqueId,
    ttl_infos: &TtlInfos,
    files: &[PartFile],
    projections: &[(String, Vec<PartFile>)],
) -> Result<DataPart, ExchangeError> {
    let disk = &volume.disk;
    disk.create_directories(relative_path)?;

    // The parent manifest tracks each projection through one rolled-up entry.
    let mut projection_entries = Vec::new();
    for (projection_name, projection_files) in projections {
        let projection_dir = format!(
            "{}/{}{}",
            relative_path, projection_name, PROJECTION_DIRECTORY_SUFFIX
        );
        let manifest = write_part_files(
            disk,
            Path::new(&projection_dir),
            projection_files,
            UniqueId::NIL,
            None,
            &[],
        )?;
        projection_entries.push((
            format!("{}{}", projection_name, PROJECTION_DIRECTORY_SUFFIX),
            manifest.total_size_on_disk(),
            manifest.total_checksum_u128(),
        ));
    }

    write_part_files(
        disk,
        Path::new(relative_path),
        files,
        uuid,
        Some(ttl_infos),
        &projection_entries,
    )?;
    DataPart::load(volume, relative_path, name)
}

fn write_part_files(
    disk: &Arc<Disk>,
    dir: &Path,
    files: &[PartFile],
    uuid: UniqueId,
    ttl_infos: Option<&TtlInfos>,
    extra_entries: &[(String, u64, u128)],
) -> Result<Checksums, ExchangeError> {
    disk.create_directories(dir)?;
    let mut checksums = Checksums::new();
    let mut shared_offsets: BTreeMap<String, u64> = BTreeMap::new();

    for file in files {
        if is_map_implicit_file(&file.name) {
            let physical = map_file_from_implicit(&file.name);
            let offset = *shared_offsets.get(&physical).unwrap_or(&0);
            let mode = if offset == 0 {
                WriteMode::Rewrite
            } else {
                WriteMode::Append
            };
            let mut out = disk.write_file(dir.join(&physical), mode)?;
            out.write_all(&file.bytes)?;
            out.finalize()?;
            checksums.add_file_with_offset(
                file.name.clone(),
                offset,
                file.bytes.len() as u64,
                hash_bytes(&file.bytes),
            );
            shared_offsets.insert(physical, offset + file.bytes.len() as u64);
        } else {
            let mut out = disk.write_file(dir.join(&file.name), WriteMode::Rewrite)?;
            out.write_all(&file.bytes)?;
            out.finalize()?;
            checksums.add_file(
                file.name.clone(),
                file.bytes.len() as u64,
                hash_bytes(&file.bytes),
            );
        }
    }

    if let Some(ttl_infos) = ttl_infos {
        let bytes = ttl_infos.serialized();
        let mut out = disk.write_file(dir.join(TTL_FILE_NAME), WriteMode::Rewrite)?;
        out.write_all(&bytes)?;
        out.finalize()?;
        checksums.add_file(TTL_FILE_NAME, bytes.len() as u64, hash_bytes(&bytes));
    }

    if !uuid.is_nil() {
        let bytes = uuid.to_uuid_string().into_bytes();
        let mut out = disk.write_file(dir.join(UUID_FILE_NAME), WriteMode::Rewrite)?;
        out.write_all(&bytes)?;
        out.finalize()?;
        checksums.add_file(UUID_FILE_NAME, bytes.len() as u64, hash_bytes(&bytes));
    }

    for (name, file_size, file_hash) in extra_entries {
        checksums.add_file(name.clone(), *file_size, *file_hash);
    }

    let mut out = disk.write_file(dir.join(CHECKSUMS_FILE_NAME), WriteMode::Rewrite)?;
    out.write_all(&checksums.serialized())?;
    out.finalize()?;
    Ok(checksums)
}

/// Build an in-memory part; the manifest covers the serialized block.
pub fn build_in_memory_part(
    volume: &Arc<Volume>,
    name: &str,
    uuid: UniqueId,
    block: RecordBatch,
) -> Result<DataPart, ExchangeError> {
    let info = PartInfo::from_part_name(name)?;
    let ipc = block_to_ipc(&block)?;
    let mut checksums = Checksums::new();
    checksums.add_file(IN_MEMORY_BLOCK_FILE_NAME, ipc.len() as u64, hash_bytes(&ipc));
    Ok(DataPart {
        name: name.to_string(),
        uuid,
        part_type: PartType::InMemory,
        info,
        ttl_infos: TtlInfos::default(),
        checksums,
        files_without_checksums: BTreeSet::new(),
        projections: BTreeMap::new(),
        volume: Arc::clone(volume),
        relative_path: "memory".to_string(),
        enable_compact_map_data: false,
        block: Some(block),
        is_temp: false,
        parent_part: None,
    })
}

#[cfg(test)]
mod tests {
    use super::{PartInfo, is_map_implicit_file, map_file_from_implicit};
    use crate::exchange::error::ExchangeError;

    #[test]
    fn part_name_parses_into_info() {
        let info = PartInfo::from_part_name("20240101_3_7_1").expect("parse");
        assert_eq!(info.partition_id, "20240101");
        assert_eq!(info.min_block, 3);
        assert_eq!(info.max_block, 7);
        assert_eq!(info.level, 1);
        assert!(!info.is_fake_drop_range_part());
    }

    #[test]
    fn malicious_part_names_are_rejected() {
        for name in ["", "noblocks", "a_1_2", "p_2_1_0", "../x_1_1_0", "p/q_1_1_0"] {
            let err = PartInfo::from_part_name(name).expect_err("must fail");
            assert!(matches!(err, ExchangeError::Validation(_)), "{}", name);
        }
    }

    #[test]
    fn drop_range_level_is_detected() {
        let info = PartInfo::from_part_name("all_0_0_999999999").expect("parse");
        assert!(info.is_fake_drop_range_part());
    }

    #[test]
    fn implicit_map_file_resolves_to_shared_file() {
        assert!(is_map_implicit_file("m.__k1__.bin"));
        assert!(!is_map_implicit_file("m.bin"));
        assert_eq!(map_file_from_implicit("m.__k1__.bin"), "m.bin");
    }
}
