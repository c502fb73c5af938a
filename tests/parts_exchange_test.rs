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
//! End-to-end part exchange over a real HTTP round trip.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;

use common::{init_test_config, local_replica, make_part, s3_replica, start_server};
use icehouse::common::types::UniqueId;
use icehouse::exchange::error::{ExchangeError, FetchStage};
use icehouse::exchange::fetcher::{FetchPartRequest, Fetcher};
use icehouse::exchange::service::Service;
use icehouse::storage::part::build_in_memory_part;
use icehouse::storage::store::PartState;

fn fetch_request<'a>(part_name: &'a str, addr: &'a std::net::SocketAddr) -> FetchPartRequest<'a> {
    FetchPartRequest {
        part_name,
        replica_path: "replica-1",
        host: "127.0.0.1",
        port: addr.port(),
        user: "",
        password: "",
        interserver_scheme: "http",
        to_detached: false,
        tmp_prefix: "",
        try_use_s3_copy: false,
        incrementally: false,
    }
}

fn sample_uuid() -> UniqueId {
    UniqueId {
        hi: 0x0123_4567_89ab_cdef,
        lo: 0xfedc_ba98_7654_3210,
    }
}

#[test]
fn full_fetch_round_trips_files_and_projections() {
    init_test_config();
    let source_dir = TempDir::new().expect("source dir");
    let target_dir = TempDir::new().expect("target dir");
    let source = local_replica(source_dir.path(), "t_round_trip");
    let target = local_replica(target_dir.path(), "t_round_trip");

    let part = make_part(
        &source,
        "all_1_1_0",
        sample_uuid(),
        &[
            ("a.bin", b"column a bytes"),
            ("a.cmrk", b"recoded marks"),
            ("m.__k1__.bin", b"map k1"),
            ("m.__k2__.bin", b"map key two"),
        ],
        &[("by_hour", &[("p.bin", b"projection bytes")])],
    );

    let addr = start_server(Arc::new(Service::new(Arc::clone(&source.store))));
    let fetcher = Fetcher::new(Arc::clone(&target.store));
    let fetched = fetcher
        .fetch_part(&fetch_request("all_1_1_0", &addr))
        .expect("fetch part");

    assert!(fetched.is_temp);
    assert!(fetched.relative_path.contains("tmp-fetch_all_1_1_0"));
    assert_eq!(fetched.uuid, sample_uuid());

    // The fetched manifest matches the source manifest entry for entry,
    // including the recoded compression file that never travelled.
    fetched
        .checksums
        .check_equal(&part.checksums, true)
        .expect("checksums match");
    assert!(fetched.checksums.has("a.cmrk"));
    assert_eq!(fetched.projections.len(), 1);

    // The shared compact-map file was reassembled byte for byte.
    let source_bytes = source
        .volume
        .disk
        .read_all(format!("data/{}/m.bin", part.name))
        .expect("read source map file");
    let target_bytes = target
        .volume
        .disk
        .read_all(format!("{}/m.bin", fetched.relative_path))
        .expect("read fetched map file");
    assert_eq!(source_bytes, target_bytes);

    let committed = target
        .store
        .commit_fetched_part(fetched)
        .expect("commit part");
    assert_eq!(committed.name, "all_1_1_0");
    assert!(target.volume.disk.exists("data/all_1_1_0/a.bin"));
}

#[cfg(unix)]
#[test]
fn incremental_fetch_hard_links_unchanged_files() {
    use std::os::unix::fs::MetadataExt;

    init_test_config();
    let source_dir = TempDir::new().expect("source dir");
    let target_dir = TempDir::new().expect("target dir");
    let source = local_replica(source_dir.path(), "t_incremental");
    let target = local_replica(target_dir.path(), "t_incremental");

    make_part(
        &source,
        "all_2_2_0",
        sample_uuid(),
        &[("big.bin", b"unchanged payload"), ("small.bin", b"version 2")],
        &[],
    );

    // The receiver still holds the previous version of the same part; only
    // `small.bin` changed.
    let old_relative = format!("{}/old_all_2_2_0", target.store.relative_data_path());
    let old_part = icehouse::storage::part::write_part(
        &target.volume,
        &old_relative,
        "all_2_2_0",
        sample_uuid(),
        &icehouse::storage::part::TtlInfos::default(),
        &[
            icehouse::storage::part::PartFile::new("big.bin", b"unchanged payload".to_vec()),
            icehouse::storage::part::PartFile::new("small.bin", b"version 1".to_vec()),
        ],
        &[],
    )
    .expect("write old part");
    target.store.add_old_version_part(Arc::new(old_part));

    let addr = start_server(Arc::new(Service::new(Arc::clone(&source.store))));
    let fetcher = Fetcher::new(Arc::clone(&target.store));
    let mut request = fetch_request("all_2_2_0", &addr);
    request.incrementally = true;
    let fetched = fetcher.fetch_part(&request).expect("fetch part");

    let big = target
        .volume
        .disk
        .absolute_path(format!("{}/big.bin", fetched.relative_path));
    let small = target
        .volume
        .disk
        .absolute_path(format!("{}/small.bin", fetched.relative_path));
    assert!(
        std::fs::metadata(&big).expect("stat big.bin").nlink() >= 2,
        "unchanged file must be hard-linked from the old version"
    );
    assert_eq!(std::fs::metadata(&small).expect("stat small.bin").nlink(), 1);
    assert_eq!(
        std::fs::read(&small).expect("read small.bin"),
        b"version 2"
    );

    // Byte-identical to a full fetch.
    let full_target_dir = TempDir::new().expect("full target dir");
    let full_target = local_replica(full_target_dir.path(), "t_incremental");
    let full_fetcher = Fetcher::new(Arc::clone(&full_target.store));
    let full = full_fetcher
        .fetch_part(&fetch_request("all_2_2_0", &addr))
        .expect("full fetch");
    fetched
        .checksums
        .check_equal(&full.checksums, true)
        .expect("incremental equals full fetch");
}

#[test]
fn in_memory_part_travels_as_native_block() {
    init_test_config();
    let source_dir = TempDir::new().expect("source dir");
    let target_dir = TempDir::new().expect("target dir");
    let source = local_replica(source_dir.path(), "t_in_memory");
    let target = local_replica(target_dir.path(), "t_in_memory");

    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    let block = RecordBatch::try_new(
        schema,
        vec![Arc::new(Int64Array::from(vec![1i64, 2, 3, 5, 8]))],
    )
    .expect("build block");
    let part = build_in_memory_part(&source.volume, "all_3_3_0", sample_uuid(), block.clone())
        .expect("build in-memory part");
    source.store.add_part(part, PartState::Committed);

    let addr = start_server(Arc::new(Service::new(Arc::clone(&source.store))));
    let fetcher = Fetcher::new(Arc::clone(&target.store));
    let fetched = fetcher
        .fetch_part(&fetch_request("all_3_3_0", &addr))
        .expect("fetch part");

    assert!(fetched.is_in_memory());
    assert_eq!(fetched.block.as_ref().expect("fetched block"), &block);
    assert_eq!(fetched.uuid, sample_uuid());
}

#[test]
fn zero_copy_fetch_shares_objects_on_same_store() {
    init_test_config();
    let source_dir = TempDir::new().expect("source dir");
    let target_dir = TempDir::new().expect("target dir");
    let objects_dir = TempDir::new().expect("objects dir");
    let source = s3_replica(source_dir.path(), objects_dir.path(), "t_zero_copy");
    let target = s3_replica(target_dir.path(), objects_dir.path(), "t_zero_copy");

    let part = make_part(
        &source,
        "all_4_4_0",
        UniqueId::NIL,
        &[("a.bin", b"shared object bytes")],
        &[],
    );

    let addr = start_server(Arc::new(Service::new(Arc::clone(&source.store))));
    let fetcher = Fetcher::new(Arc::clone(&target.store));
    let mut request = fetch_request("all_4_4_0", &addr);
    request.try_use_s3_copy = true;
    let fetched = fetcher.fetch_part(&request).expect("fetch part");

    // Metadata documents reference the very same objects.
    assert_eq!(
        target
            .volume
            .disk
            .read_all(format!("{}/a.bin", fetched.relative_path))
            .expect("read through metadata"),
        b"shared object bytes"
    );
    fetched
        .checksums
        .check_equal(&part.checksums, true)
        .expect("checksums match");
}

#[test]
fn zero_copy_against_local_source_falls_back_to_normal_fetch() {
    init_test_config();
    let source_dir = TempDir::new().expect("source dir");
    let target_dir = TempDir::new().expect("target dir");
    let target_objects = TempDir::new().expect("target objects dir");
    // Source sits on a plain local disk; the server must not set the
    // zero-copy cookie and the client must succeed in normal mode.
    let source = local_replica(source_dir.path(), "t_fallback");
    let target = s3_replica(target_dir.path(), target_objects.path(), "t_fallback");

    let part = make_part(
        &source,
        "all_5_5_0",
        UniqueId::NIL,
        &[("a.bin", b"plain bytes")],
        &[],
    );

    let addr = start_server(Arc::new(Service::new(Arc::clone(&source.store))));
    let fetcher = Fetcher::new(Arc::clone(&target.store));
    let mut request = fetch_request("all_5_5_0", &addr);
    request.try_use_s3_copy = true;
    let fetched = fetcher.fetch_part(&request).expect("fetch part");
    fetched
        .checksums
        .check_equal(&part.checksums, true)
        .expect("checksums match");
}

#[test]
fn list_and_exist_queries_answer_over_http() {
    init_test_config();
    let source_dir = TempDir::new().expect("source dir");
    let source = local_replica(source_dir.path(), "t_list");
    make_part(&source, "p1_1_1_0", UniqueId::NIL, &[("a.bin", b"x")], &[]);
    make_part(&source, "p1_2_2_0", UniqueId::NIL, &[("a.bin", b"y")], &[]);
    make_part(&source, "p2_1_1_0", UniqueId::NIL, &[("a.bin", b"z")], &[]);

    let target_dir = TempDir::new().expect("target dir");
    let target = local_replica(target_dir.path(), "t_list");
    let addr = start_server(Arc::new(Service::new(Arc::clone(&source.store))));
    let fetcher = Fetcher::new(Arc::clone(&target.store));

    let mut all = fetcher
        .fetch_part_list("all", "", "replica-1", "127.0.0.1", addr.port(), "http")
        .expect("fetch list");
    all.sort();
    assert_eq!(all, ["p1_1_1_0", "p1_2_2_0", "p2_1_1_0"]);

    let p1 = fetcher
        .fetch_part_list("p1", "", "replica-1", "127.0.0.1", addr.port(), "http")
        .expect("fetch partition list");
    assert_eq!(p1.len(), 2);

    let filtered = fetcher
        .fetch_part_list(
            "",
            "partition_id = 'p2'",
            "replica-1",
            "127.0.0.1",
            addr.port(),
            "http",
        )
        .expect("fetch filtered list");
    assert_eq!(filtered, ["p2_1_1_0"]);

    assert!(
        fetcher
            .check_part_exists("p1_1_1_0", "replica-1", "127.0.0.1", addr.port(), "http")
            .expect("check exists")
    );
    assert!(
        !fetcher
            .check_part_exists("p9_1_1_0", "replica-1", "127.0.0.1", addr.port(), "http")
            .expect("check exists")
    );
}

#[test]
fn saturated_table_sends_answer_with_too_many_requests() {
    init_test_config();
    let source_dir = TempDir::new().expect("source dir");
    let source = local_replica(source_dir.path(), "t_admission");
    make_part(&source, "all_6_6_0", UniqueId::NIL, &[("a.bin", b"x")], &[]);

    // The per-table counter is at its configured cap of 64.
    source.store.current_table_sends.store(64, Ordering::Release);

    let target_dir = TempDir::new().expect("target dir");
    let target = local_replica(target_dir.path(), "t_admission");
    let addr = start_server(Arc::new(Service::new(Arc::clone(&source.store))));
    let fetcher = Fetcher::new(Arc::clone(&target.store));
    let err = fetcher
        .fetch_part(&fetch_request("all_6_6_0", &addr))
        .expect_err("must be rejected");
    assert_eq!(err.stage, FetchStage::Admission);
    assert!(matches!(err.source, ExchangeError::TooManySends));

    // Once a slot frees up the same fetch goes through.
    source.store.current_table_sends.store(0, Ordering::Release);
    fetcher
        .fetch_part(&fetch_request("all_6_6_0", &addr))
        .expect("fetch after backoff");
}

#[test]
fn malformed_part_name_is_rejected_before_any_request() {
    init_test_config();
    let target_dir = TempDir::new().expect("target dir");
    let target = local_replica(target_dir.path(), "t_badname");
    let fetcher = Fetcher::new(Arc::clone(&target.store));
    let addr: std::net::SocketAddr = "127.0.0.1:1".parse().expect("addr");
    let err = fetcher
        .fetch_part(&fetch_request("../../etc/passwd", &addr))
        .expect_err("must fail");
    assert_eq!(err.stage, FetchStage::Admission);
    assert!(matches!(err.source, ExchangeError::Validation(_)));
}
