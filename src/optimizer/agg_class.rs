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

/// Pushability class of an aggregate function.
///
/// `Basic` functions are self-mergeable: applying the function to its own
/// partial results yields the full result. `NeedsMerge` functions must be
/// split into a `<name>State` below the join and a `<name>Merge` above it.
/// An `Unknown` function anywhere in the aggregate prevents the rewrite.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AggFuncClass {
    Basic,
    NeedsMerge,
    Unknown,
}

const SELF_MERGEABLE_FUNCTIONS: &[&str] = &[
    "any",
    "anylast",
    "min",
    "max",
    "sum",
    "sumwithoverflow",
    "groupbitand",
    "groupbitor",
    "groupbitxor",
    "summap",
    "minmap",
    "maxmap",
    "grouparrayarray",
    "grouparraylastarray",
    "groupuniqarrayarray",
    "summappedarrays",
    "minmappedarrays",
    "maxmappedarrays",
];

pub fn class_of_agg_func(name: &str) -> AggFuncClass {
    let name = name.to_lowercase();

    if SELF_MERGEABLE_FUNCTIONS.contains(&name.as_str()) {
        return AggFuncClass::Basic;
    }
    if name == "uniqexact" || name == "count" {
        return AggFuncClass::NeedsMerge;
    }
    AggFuncClass::Unknown
}

/// `sum` decomposes into `sumState` below the join and `sumMerge` above it.
pub fn state_name(func_name: &str) -> String {
    format!("{}State", func_name)
}

pub fn merge_name(func_name: &str) -> String {
    format!("{}Merge", func_name)
}
