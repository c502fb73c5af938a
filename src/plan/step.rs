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
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use arrow::datatypes::DataType;

use crate::plan::expr::ScalarExpr;

/// One output column of a plan node.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnWithType {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnWithType {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered output schema of a plan node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataStream {
    pub columns: Vec<ColumnWithType>,
}

impl DataStream {
    pub fn new(columns: Vec<ColumnWithType>) -> Self {
        Self { columns }
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn name_set(&self) -> HashSet<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn name_to_type(&self) -> HashMap<String, DataType> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type.clone()))
            .collect()
    }

    pub fn type_of(&self, name: &str) -> Option<&DataType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.data_type)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// Resolved aggregate function handle: a name plus the type it yields.
///
/// Resolution goes through an [`AggregateFunctionResolver`]; `State`/`Merge`
/// siblings are derived by suffixing the name and re-resolving.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateFunction {
    pub name: String,
    pub result_type: DataType,
}

pub trait AggregateFunctionResolver: Sync {
    fn resolve(
        &self,
        name: &str,
        arg_types: &[DataType],
        params: &[String],
    ) -> Result<AggregateFunction, String>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateDescription {
    pub function: AggregateFunction,
    pub parameters: Vec<String>,
    pub argument_names: Vec<String>,
    pub output_column_name: String,
}

impl fmt::Display for AggregateDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) as {}",
            self.function.name,
            self.argument_names.join(", "),
            self.output_column_name
        )
    }
}

pub fn format_aggregates(descriptions: &[AggregateDescription]) -> String {
    descriptions
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Aggregation step: group keys followed by aggregate outputs.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatingStep {
    pub keys: Vec<String>,
    pub keys_not_hashed: BTreeSet<String>,
    pub aggregates: Vec<AggregateDescription>,
    /// Final values vs intermediate states.
    pub is_final: bool,
    pub hints: Vec<String>,
}

impl AggregatingStep {
    pub fn new(keys: Vec<String>, aggregates: Vec<AggregateDescription>, is_final: bool) -> Self {
        Self {
            keys,
            keys_not_hashed: BTreeSet::new(),
            aggregates,
            is_final,
            hints: Vec::new(),
        }
    }

    /// A plain (non-grouping-set, keyed) aggregation the rewriter can touch.
    pub fn is_normal(&self) -> bool {
        self.is_final
    }
}

/// Ordered `name := expr` assignments of a projection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assignments {
    entries: Vec<(String, ScalarExpr)>,
}

impl Assignments {
    pub fn new(entries: Vec<(String, ScalarExpr)>) -> Self {
        Self { entries }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&ScalarExpr> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn insert(&mut self, name: impl Into<String>, expr: ScalarExpr) {
        self.entries.push((name.into(), expr));
    }

    pub fn remove(&mut self, name: &str) -> Option<ScalarExpr> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ScalarExpr)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionStep {
    pub assignments: Assignments,
    pub name_to_type: HashMap<String, DataType>,
    pub is_final_project: bool,
    pub hints: Vec<String>,
}

impl ProjectionStep {
    pub fn new(assignments: Assignments, name_to_type: HashMap<String, DataType>) -> Self {
        Self {
            assignments,
            name_to_type,
            is_final_project: false,
            hints: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinStrictness {
    All,
    Any,
    Semi,
    Anti,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DistributionType {
    Unspecified,
    Repartition,
    Broadcast,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinAlgorithm {
    Auto,
    Hash,
    NestedLoop,
}

/// Equality join. `left_keys[i]` pairs with `right_keys[i]`; everything
/// besides keys, filter and the output header is carried through rewrites
/// untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinStep {
    pub kind: JoinKind,
    pub strictness: JoinStrictness,
    pub left_keys: Vec<String>,
    pub right_keys: Vec<String>,
    pub filter: Option<ScalarExpr>,
    pub has_using: bool,
    pub distribution: DistributionType,
    pub algorithm: JoinAlgorithm,
    pub is_ordered: bool,
    pub hints: Vec<String>,
}

impl JoinStep {
    pub fn inner(left_keys: Vec<String>, right_keys: Vec<String>) -> Self {
        Self {
            kind: JoinKind::Inner,
            strictness: JoinStrictness::All,
            left_keys,
            right_keys,
            filter: None,
            has_using: false,
            distribution: DistributionType::Unspecified,
            algorithm: JoinAlgorithm::Auto,
            is_ordered: false,
            hints: Vec::new(),
        }
    }
}

/// Leaf producing a fixed schema; stands in for scans and other steps the
/// rewriter does not descend into.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceStep {
    pub columns: Vec<ColumnWithType>,
}

impl SourceStep {
    pub fn new(columns: Vec<ColumnWithType>) -> Self {
        Self { columns }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlanStep {
    Aggregating(AggregatingStep),
    Projection(ProjectionStep),
    Join(JoinStep),
    Source(SourceStep),
}

impl PlanStep {
    pub fn is_aggregating(&self) -> bool {
        matches!(self, PlanStep::Aggregating(_))
    }

    pub fn is_projection(&self) -> bool {
        matches!(self, PlanStep::Projection(_))
    }

    pub fn is_join(&self) -> bool {
        matches!(self, PlanStep::Join(_))
    }
}
