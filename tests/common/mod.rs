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
//! Common helpers for part-exchange integration tests.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Once};

use icehouse::common::types::UniqueId;
use icehouse::exchange::service::Service;
use icehouse::icehouse_config;
use icehouse::service::http_server;
use icehouse::storage::disk::Disk;
use icehouse::storage::part::{DataPart, PartFile, TtlInfos, Volume, write_part};
use icehouse::storage::store::{PartState, PartStore};

static INIT: Once = Once::new();

/// Every test in this binary shares one global config; install it before the
/// first config read.
pub fn init_test_config() {
    INIT.call_once(|| {
        let path = std::env::temp_dir().join(format!(
            "icehouse-test-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"
log_level = "warn"

[replication]
allow_remote_fs_zero_copy_replication = true
replicated_max_parallel_sends_for_table = 64
"#,
        )
        .expect("write test config");
        icehouse_config::init_from_path(&path).expect("init test config");
    });
}

pub struct Replica {
    pub store: Arc<PartStore>,
    pub volume: Arc<Volume>,
}

pub fn local_replica(root: &std::path::Path, table: &str) -> Replica {
    let disk = Arc::new(Disk::local("disk0", root));
    disk.create_directories("data").expect("create data dir");
    let store = Arc::new(PartStore::new(table, "data", vec![Arc::clone(&disk)]));
    let volume = Volume::single_disk("vol0", disk);
    Replica { store, volume }
}

pub fn s3_replica(root: &std::path::Path, objects: &std::path::Path, table: &str) -> Replica {
    let disk = Arc::new(Disk::s3("s3disk0", root, objects));
    disk.create_directories("data").expect("create data dir");
    let store = Arc::new(PartStore::new(table, "data", vec![Arc::clone(&disk)]));
    let volume = Volume::single_disk("vol0", disk);
    Replica { store, volume }
}

pub fn make_part(
    replica: &Replica,
    name: &str,
    uuid: UniqueId,
    files: &[(&str, &[u8])],
    projections: &[(&str, &[(&str, &[u8])])],
) -> Arc<DataPart> {
    let files: Vec<PartFile> = files
        .iter()
        .map(|(file_name, bytes)| PartFile::new(*file_name, *bytes))
        .collect();
    let projections: Vec<(String, Vec<PartFile>)> = projections
        .iter()
        .map(|(projection_name, projection_files)| {
            (
                projection_name.to_string(),
                projection_files
                    .iter()
                    .map(|(file_name, bytes)| PartFile::new(*file_name, *bytes))
                    .collect(),
            )
        })
        .collect();
    let relative_path = format!("{}/{}", replica.store.relative_data_path(), name);
    let part = write_part(
        &replica.volume,
        &relative_path,
        name,
        uuid,
        &TtlInfos::default(),
        &files,
        &projections,
    )
    .expect("write part");
    replica.store.add_part(part, PartState::Committed)
}

/// Serve `service` on an ephemeral port from a background runtime thread.
pub fn start_server(service: Arc<Service>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("build test runtime");
        runtime
            .block_on(http_server::serve(listener, service))
            .expect("serve test exchange");
    });
    addr
}
