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
use std::sync::Arc;

use anyhow::{Context, Result};

use icehouse::exchange::service::Service;
use icehouse::exchange::wire::Throttler;
use icehouse::icehouse_config;
use icehouse::icehouse_logging;
use icehouse::service::http_server;
use icehouse::storage::disk::Disk;
use icehouse::storage::store::PartStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = icehouse_config::init_from_env_or_default()?;
    let filter = config
        .log_filter
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    icehouse_logging::init_with_level(&filter);

    let mut disks = Vec::new();
    for (index, dir) in config.storage.data_dirs.iter().enumerate() {
        std::fs::create_dir_all(dir).with_context(|| format!("create data dir {}", dir))?;
        disks.push(Arc::new(Disk::local(format!("disk{}", index), dir)));
    }
    if disks.is_empty() {
        anyhow::bail!("no data_dirs configured under [storage]");
    }

    let mut store = PartStore::new(config.storage.table.clone(), "data".to_string(), disks);
    if config.replication.max_replicated_send_bytes_per_sec > 0 {
        store = store.with_sends_throttler(Arc::new(Throttler::new(
            config.replication.max_replicated_send_bytes_per_sec,
        )));
    }
    let store = Arc::new(store);
    for disk in store.disks() {
        disk.create_directories(store.relative_data_path())
            .context("create data directory on disk")?;
    }

    let service = Arc::new(Service::new(store));
    http_server::start_exchange_server(&config.server.host, config.server.http_port, service).await
}
