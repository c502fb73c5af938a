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
use std::io::{Read, Write};

use twox_hash::xxhash3_128::Hasher;

use crate::exchange::error::ExchangeError;
use crate::exchange::wire;

const CHECKSUMS_FORMAT_HEADER: &[u8] = b"checksums format version: 1\n";

/// Per-file manifest entry. `file_offset` is set for logical sub-columns
/// stored inside a shared compact-map file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    pub file_size: u64,
    pub file_hash: u128,
    pub file_offset: Option<u64>,
}

impl Checksum {
    pub fn new(file_size: u64, file_hash: u128) -> Self {
        Self {
            file_size,
            file_hash,
            file_offset: None,
        }
    }

    pub fn with_offset(file_size: u64, file_hash: u128, file_offset: u64) -> Self {
        Self {
            file_size,
            file_hash,
            file_offset: Some(file_offset),
        }
    }
}

/// Ordered manifest of a part's files. Serialization is explicitly
/// versioned and never depends on hash-map iteration order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Checksums {
    pub files: BTreeMap<String, Checksum>,
}

impl Checksums {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: impl Into<String>, file_size: u64, file_hash: u128) {
        self.files.insert(name.into(), Checksum::new(file_size, file_hash));
    }

    pub fn add_file_with_offset(
        &mut self,
        name: impl Into<String>,
        file_offset: u64,
        file_size: u64,
        file_hash: u128,
    ) {
        self.files
            .insert(name.into(), Checksum::with_offset(file_size, file_hash, file_offset));
    }

    pub fn has(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Entry-level equality ignoring offsets: same bytes in both manifests.
    pub fn is_equal(&self, other: &Checksums, name: &str) -> bool {
        match (self.files.get(name), other.files.get(name)) {
            (Some(mine), Some(theirs)) => {
                mine.file_size == theirs.file_size && mine.file_hash == theirs.file_hash
            }
            _ => false,
        }
    }

    pub fn total_size_on_disk(&self) -> u64 {
        self.files.values().map(|c| c.file_size).sum()
    }

    /// Combined hash over every entry, stable across processes.
    pub fn total_checksum_u128(&self) -> u128 {
        let mut hasher = Hasher::with_seed(0);
        for (name, checksum) in &self.files {
            hasher.write(name.as_bytes());
            hasher.write(&checksum.file_size.to_le_bytes());
            hasher.write(&checksum.file_hash.to_le_bytes());
        }
        hasher.finish_128()
    }

    pub fn write(&self, out: &mut impl Write) -> Result<(), ExchangeError> {
        out.write_all(CHECKSUMS_FORMAT_HEADER)?;
        wire::write_varuint(out, self.files.len() as u64)?;
        for (name, checksum) in &self.files {
            wire::write_string(out, name)?;
            wire::write_u64(out, checksum.file_size)?;
            wire::write_u128(out, checksum.file_hash)?;
            wire::write_bool(out, checksum.file_offset.is_some())?;
            if let Some(offset) = checksum.file_offset {
                wire::write_u64(out, offset)?;
            }
        }
        Ok(())
    }

    pub fn read(input: &mut impl Read) -> Result<Checksums, ExchangeError> {
        let mut header = vec![0u8; CHECKSUMS_FORMAT_HEADER.len()];
        input
            .read_exact(&mut header)
            .map_err(|_| ExchangeError::ChecksumFormatTooOld)?;
        if header != CHECKSUMS_FORMAT_HEADER {
            return Err(ExchangeError::ChecksumFormatTooOld);
        }
        let count = wire::read_varuint(input)?;
        let mut files = BTreeMap::new();
        for _ in 0..count {
            let name = wire::read_string(input)?;
            let file_size = wire::read_u64(input)?;
            let file_hash = wire::read_u128(input)?;
            let file_offset = if wire::read_bool(input)? {
                Some(wire::read_u64(input)?)
            } else {
                None
            };
            files.insert(
                name,
                Checksum {
                    file_size,
                    file_hash,
                    file_offset,
                },
            );
        }
        Ok(Checksums { files })
    }

    pub fn serialized(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out).expect("serialize checksums to memory");
        out
    }

    pub fn from_serialized(bytes: &[u8]) -> Result<Checksums, ExchangeError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let checksums = Self::read(&mut cursor)?;
        wire::assert_eof(&mut cursor)?;
        Ok(checksums)
    }

    /// Strict comparison of both manifests; the first difference fails.
    pub fn check_equal(&self, other: &Checksums, check_sizes: bool) -> Result<(), ExchangeError> {
        for (name, theirs) in &other.files {
            let Some(mine) = self.files.get(name) else {
                return Err(ExchangeError::ChecksumMismatch(format!(
                    "{} (missing locally)",
                    name
                )));
            };
            if mine.file_hash != theirs.file_hash {
                return Err(ExchangeError::ChecksumMismatch(name.clone()));
            }
            if check_sizes && mine.file_size != theirs.file_size {
                return Err(ExchangeError::BadSizeOfFile(name.clone()));
            }
        }
        for name in self.files.keys() {
            if !other.files.contains_key(name) {
                return Err(ExchangeError::ChecksumMismatch(format!(
                    "{} (unexpected locally)",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Compact-map sub-columns may land at a different offset in the shared
    /// file than on the source replica. Adopt the peer's offsets when bytes
    /// match; returns true when anything changed.
    pub fn adjust_diff_implicit_key_offset(&mut self, other: &Checksums) -> bool {
        let mut changed = false;
        for (name, mine) in self.files.iter_mut() {
            if !crate::storage::part::is_map_implicit_file(name) {
                continue;
            }
            let Some(theirs) = other.files.get(name) else {
                continue;
            };
            if mine.file_size == theirs.file_size
                && mine.file_hash == theirs.file_hash
                && mine.file_offset != theirs.file_offset
            {
                mine.file_offset = theirs.file_offset;
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::{Checksum, Checksums};
    use crate::exchange::error::ExchangeError;

    fn sample() -> Checksums {
        let mut checksums = Checksums::new();
        checksums.add_file("a.bin", 10, 0xDEAD);
        checksums.add_file_with_offset("m.__k1__.bin", 16, 4, 0xBEEF);
        checksums.add_file("columns.txt", 3, 0x1234);
        checksums
    }

    #[test]
    fn serialization_round_trips() {
        let checksums = sample();
        let decoded = Checksums::from_serialized(&checksums.serialized()).expect("decode");
        assert_eq!(decoded, checksums);
    }

    #[test]
    fn unversioned_payload_is_too_old() {
        let err = Checksums::from_serialized(b"garbage").expect_err("must fail");
        assert!(matches!(err, ExchangeError::ChecksumFormatTooOld));
    }

    #[test]
    fn check_equal_reports_first_mismatch() {
        let mine = sample();
        let mut theirs = sample();
        theirs.files.insert("a.bin".to_string(), Checksum::new(10, 0xFFFF));
        let err = mine.check_equal(&theirs, false).expect_err("must fail");
        assert!(matches!(err, ExchangeError::ChecksumMismatch(name) if name == "a.bin"));
    }

    #[test]
    fn implicit_key_offsets_are_adopted_when_bytes_match() {
        let mut mine = sample();
        let mut theirs = sample();
        theirs
            .files
            .insert("m.__k1__.bin".to_string(), Checksum::with_offset(4, 0xBEEF, 128));
        assert!(mine.adjust_diff_implicit_key_offset(&theirs));
        assert_eq!(
            mine.files["m.__k1__.bin"].file_offset,
            Some(128)
        );
        // Plain files keep their offsets even when they differ.
        assert!(!mine.adjust_diff_implicit_key_offset(&theirs));
    }
}
