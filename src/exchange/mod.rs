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
pub mod error;
pub mod fetcher;
pub mod service;
pub mod wire;

pub const REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE: u32 = 1;
pub const REPLICATION_PROTOCOL_VERSION_WITH_PARTS_SIZE_AND_TTL_INFOS: u32 = 2;
pub const REPLICATION_PROTOCOL_VERSION_WITH_PARTS_TYPE: u32 = 3;
pub const REPLICATION_PROTOCOL_VERSION_WITH_PARTS_DEFAULT_COMPRESSION: u32 = 4;
pub const REPLICATION_PROTOCOL_VERSION_WITH_PARTS_UUID: u32 = 5;
pub const REPLICATION_PROTOCOL_VERSION_WITH_PARTS_S3_COPY: u32 = 6;
pub const REPLICATION_PROTOCOL_VERSION_WITH_PARTS_PROJECTION: u32 = 7;

pub fn endpoint_id(node_id: &str) -> String {
    format!("DataPartsExchange:{}", node_id)
}
