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
use std::collections::HashMap;
use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::plan::PlanArena;

/// Column-level statistics as the cardinality estimator reports them.
#[derive(Clone, Debug, Default)]
pub struct SymbolStatistics {
    pub ndv: u64,
    pub nulls_count: u64,
}

impl SymbolStatistics {
    pub fn is_unknown(&self) -> bool {
        self.ndv == 0 && self.nulls_count == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlanNodeStatistics {
    pub row_count: u64,
    pub symbol_statistics: HashMap<String, SymbolStatistics>,
}

impl PlanNodeStatistics {
    pub fn symbol(&self, name: &str) -> Option<&SymbolStatistics> {
        self.symbol_statistics.get(name)
    }
}

/// The estimator itself lives outside this crate; the optimizer only asks
/// for a node's statistics and tolerates absence.
pub trait CardinalityEstimator: Sync {
    fn estimate(&self, arena: &PlanArena, node: PlanNodeId) -> Option<Arc<PlanNodeStatistics>>;
}

/// Estimator with a fixed per-node answer; used by tests and by callers that
/// precompute statistics.
#[derive(Default)]
pub struct FixedStatistics {
    stats: HashMap<PlanNodeId, Arc<PlanNodeStatistics>>,
}

impl FixedStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: PlanNodeId, stats: PlanNodeStatistics) {
        self.stats.insert(node, Arc::new(stats));
    }
}

impl CardinalityEstimator for FixedStatistics {
    fn estimate(&self, _arena: &PlanArena, node: PlanNodeId) -> Option<Arc<PlanNodeStatistics>> {
        self.stats.get(&node).cloned()
    }
}

/// Estimator that knows nothing; every lookup misses.
pub struct NoStatistics;

impl CardinalityEstimator for NoStatistics {
    fn estimate(&self, _arena: &PlanArena, _node: PlanNodeId) -> Option<Arc<PlanNodeStatistics>> {
        None
    }
}
