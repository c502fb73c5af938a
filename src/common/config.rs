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
use crate::icehouse_config::config as icehouse_app_config;

pub(crate) fn replicated_max_parallel_sends() -> u32 {
    icehouse_app_config()
        .ok()
        .map(|c| c.replication.replicated_max_parallel_sends)
        .unwrap_or(0)
}

pub(crate) fn replicated_max_parallel_sends_for_table() -> u32 {
    icehouse_app_config()
        .ok()
        .map(|c| c.replication.replicated_max_parallel_sends_for_table)
        .unwrap_or(0)
}

pub(crate) fn replicated_max_parallel_fetches_for_host() -> u32 {
    icehouse_app_config()
        .ok()
        .map(|c| c.replication.replicated_max_parallel_fetches_for_host)
        .unwrap_or(0)
}

pub(crate) fn allow_remote_fs_zero_copy_replication() -> bool {
    icehouse_app_config()
        .ok()
        .map(|c| c.replication.allow_remote_fs_zero_copy_replication)
        .unwrap_or(false)
}

pub(crate) fn min_compressed_bytes_to_fsync_after_fetch() -> u64 {
    icehouse_app_config()
        .ok()
        .map(|c| c.replication.min_compressed_bytes_to_fsync_after_fetch)
        .unwrap_or(0)
}

pub(crate) fn fsync_part_directory() -> bool {
    icehouse_app_config()
        .ok()
        .map(|c| c.replication.fsync_part_directory)
        .unwrap_or(false)
}

