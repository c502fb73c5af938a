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
use std::fmt;

use thiserror::Error;

/// Failure taxonomy of the part exchange.
///
/// `Aborted` and `Network` never mark the source part as broken on the
/// sender; everything else does.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("no part {0} in table")]
    NoSuchPart(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("checksum mismatch for file {0}")]
    ChecksumMismatch(String),

    #[error("unexpected size of file {0}")]
    BadSizeOfFile(String),

    #[error("file path ({path}) doesn't appear to be inside part path ({part_path})")]
    InsecurePath { path: String, part_path: String },

    #[error("operation was cancelled")]
    Aborted,

    #[error("checksums format is too old")]
    ChecksumFormatTooOld,

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("too many concurrent fetches, try again later")]
    TooManySends,

    #[error("incorrect part type: {0}")]
    IncorrectPartType(String),

    #[error("directory {0} already exists")]
    DirectoryAlreadyExists(String),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("logical error: {0}")]
    Logical(String),
}

impl ExchangeError {
    /// Failures the sender should not blame on the part itself.
    pub fn is_benign_for_sender(&self) -> bool {
        matches!(self, ExchangeError::Aborted | ExchangeError::Network(_))
    }
}

/// Which phase of a fetch produced the error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FetchStage {
    Admission,
    Header,
    Body,
    Finalize,
}

impl fmt::Display for FetchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchStage::Admission => "admission",
            FetchStage::Header => "header",
            FetchStage::Body => "body",
            FetchStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("fetch failed at {stage} stage: {source}")]
pub struct FetchError {
    pub stage: FetchStage,
    #[source]
    pub source: ExchangeError,
}

impl FetchError {
    pub fn new(stage: FetchStage, source: ExchangeError) -> Self {
        Self { stage, source }
    }
}

pub(crate) trait StageExt<T> {
    fn at_stage(self, stage: FetchStage) -> Result<T, FetchError>;
}

impl<T> StageExt<T> for Result<T, ExchangeError> {
    fn at_stage(self, stage: FetchStage) -> Result<T, FetchError> {
        self.map_err(|source| FetchError::new(stage, source))
    }
}
