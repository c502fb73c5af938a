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
pub mod expr;
pub mod step;
pub mod symbol;

use std::collections::BTreeMap;

use crate::common::ids::PlanNodeId;
use crate::plan::step::{ColumnWithType, DataStream, PlanStep};

/// Immutable plan node: a step, child ids and the computed output stream.
///
/// Nodes hold child ids, never parent pointers; a rewrite builds replacement
/// nodes and shares untouched subtrees by id.
#[derive(Clone, Debug)]
pub struct PlanNode {
    pub id: PlanNodeId,
    pub step: PlanStep,
    pub children: Vec<PlanNodeId>,
    pub stream: DataStream,
}

/// Arena of plan nodes addressed by stable integer ids.
#[derive(Clone, Debug, Default)]
pub struct PlanArena {
    nodes: BTreeMap<PlanNodeId, PlanNode>,
    next_id: u32,
}

impl PlanArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: PlanNodeId) -> Option<&PlanNode> {
        self.nodes.get(&id)
    }

    pub fn node_ok(&self, id: PlanNodeId) -> Result<&PlanNode, String> {
        self.nodes
            .get(&id)
            .ok_or_else(|| format!("plan node {} not found in arena", id))
    }

    pub fn child(&self, id: PlanNodeId, index: usize) -> Result<&PlanNode, String> {
        let node = self.node_ok(id)?;
        let child_id = *node
            .children
            .get(index)
            .ok_or_else(|| format!("plan node {} has no child {}", id, index))?;
        self.node_ok(child_id)
    }

    pub fn stream(&self, id: PlanNodeId) -> Result<&DataStream, String> {
        Ok(&self.node_ok(id)?.stream)
    }

    pub fn next_node_id(&mut self) -> PlanNodeId {
        let id = PlanNodeId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Insert a new node; its output stream is derived from the step and the
    /// children already in the arena.
    pub fn add(&mut self, step: PlanStep, children: Vec<PlanNodeId>) -> Result<PlanNodeId, String> {
        let id = self.next_node_id();
        let stream = self.compute_stream(&step, &children)?;
        self.nodes.insert(
            id,
            PlanNode {
                id,
                step,
                children,
                stream,
            },
        );
        Ok(id)
    }

    /// Replace the step and children of an existing node, keeping its id.
    pub fn replace(
        &mut self,
        id: PlanNodeId,
        step: PlanStep,
        children: Vec<PlanNodeId>,
    ) -> Result<(), String> {
        self.node_ok(id)?;
        let stream = self.compute_stream(&step, &children)?;
        self.nodes.insert(
            id,
            PlanNode {
                id,
                step,
                children,
                stream,
            },
        );
        Ok(())
    }

    /// All symbol names appearing in any node's output stream.
    pub fn all_stream_names(&self) -> impl Iterator<Item = String> + '_ {
        self.nodes
            .values()
            .flat_map(|n| n.stream.columns.iter().map(|c| c.name.clone()))
    }

    fn compute_stream(
        &self,
        step: &PlanStep,
        children: &[PlanNodeId],
    ) -> Result<DataStream, String> {
        match step {
            PlanStep::Source(source) => {
                if !children.is_empty() {
                    return Err("source step cannot have children".to_string());
                }
                Ok(DataStream::new(source.columns.clone()))
            }
            PlanStep::Projection(projection) => {
                let [child] = children else {
                    return Err("projection step requires exactly one child".to_string());
                };
                self.node_ok(*child)?;
                let mut columns = Vec::with_capacity(projection.assignments.len());
                for (name, _) in projection.assignments.iter() {
                    let data_type = projection
                        .name_to_type
                        .get(name)
                        .ok_or_else(|| format!("projection output '{}' has no type", name))?;
                    columns.push(ColumnWithType::new(name.clone(), data_type.clone()));
                }
                Ok(DataStream::new(columns))
            }
            PlanStep::Aggregating(agg) => {
                let [child] = children else {
                    return Err("aggregating step requires exactly one child".to_string());
                };
                let child_stream = &self.node_ok(*child)?.stream;
                let mut columns = Vec::with_capacity(agg.keys.len() + agg.aggregates.len());
                for key in &agg.keys {
                    let data_type = child_stream
                        .type_of(key)
                        .ok_or_else(|| format!("group key '{}' missing from child stream", key))?;
                    columns.push(ColumnWithType::new(key.clone(), data_type.clone()));
                }
                for desc in &agg.aggregates {
                    columns.push(ColumnWithType::new(
                        desc.output_column_name.clone(),
                        desc.function.result_type.clone(),
                    ));
                }
                Ok(DataStream::new(columns))
            }
            PlanStep::Join(_) => {
                let [left, right] = children else {
                    return Err("join step requires exactly two children".to_string());
                };
                let mut columns = self.node_ok(*left)?.stream.columns.clone();
                columns.extend(self.node_ok(*right)?.stream.columns.clone());
                Ok(DataStream::new(columns))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PlanArena;
    use crate::plan::step::{
        AggregateDescription, AggregateFunction, AggregatingStep, ColumnWithType, JoinStep,
        PlanStep, SourceStep,
    };
    use arrow::datatypes::DataType;

    #[test]
    fn join_stream_concatenates_children() {
        let mut arena = PlanArena::new();
        let left = arena
            .add(
                PlanStep::Source(SourceStep::new(vec![
                    ColumnWithType::new("a", DataType::Int64),
                    ColumnWithType::new("x", DataType::Int64),
                ])),
                vec![],
            )
            .expect("add left");
        let right = arena
            .add(
                PlanStep::Source(SourceStep::new(vec![ColumnWithType::new(
                    "b",
                    DataType::Int64,
                )])),
                vec![],
            )
            .expect("add right");
        let join = arena
            .add(
                PlanStep::Join(JoinStep::inner(
                    vec!["a".to_string()],
                    vec!["b".to_string()],
                )),
                vec![left, right],
            )
            .expect("add join");
        assert_eq!(
            arena.node(join).expect("join node").stream.names(),
            ["a", "x", "b"]
        );
    }

    #[test]
    fn aggregating_stream_is_keys_then_outputs() {
        let mut arena = PlanArena::new();
        let source = arena
            .add(
                PlanStep::Source(SourceStep::new(vec![
                    ColumnWithType::new("a", DataType::Int64),
                    ColumnWithType::new("x", DataType::Int64),
                ])),
                vec![],
            )
            .expect("add source");
        let agg = arena
            .add(
                PlanStep::Aggregating(AggregatingStep::new(
                    vec!["a".to_string()],
                    vec![AggregateDescription {
                        function: AggregateFunction {
                            name: "sum".to_string(),
                            result_type: DataType::Int64,
                        },
                        parameters: vec![],
                        argument_names: vec!["x".to_string()],
                        output_column_name: "s".to_string(),
                    }],
                    true,
                )),
                vec![source],
            )
            .expect("add agg");
        assert_eq!(arena.node(agg).expect("agg node").stream.names(), ["a", "s"]);
    }

    #[test]
    fn missing_group_key_is_an_error() {
        let mut arena = PlanArena::new();
        let source = arena
            .add(
                PlanStep::Source(SourceStep::new(vec![ColumnWithType::new(
                    "a",
                    DataType::Int64,
                )])),
                vec![],
            )
            .expect("add source");
        let result = arena.add(
            PlanStep::Aggregating(AggregatingStep::new(vec!["missing".to_string()], vec![], true)),
            vec![source],
        );
        assert!(result.is_err());
    }
}
