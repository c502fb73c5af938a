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
//! End-to-end coverage of the eager-aggregation rewrite.

use std::collections::HashMap;

use arrow::datatypes::DataType;

use icehouse::common::app_config::OptimizerConfig;
use icehouse::common::ids::PlanNodeId;
use icehouse::optimizer::cardinality::{
    CardinalityEstimator, FixedStatistics, NoStatistics, PlanNodeStatistics, SymbolStatistics,
};
use icehouse::optimizer::eager_aggregation::{EagerAggregation, RuleContext};
use icehouse::optimizer::functions::BuiltinAggregateResolver;
use icehouse::plan::PlanArena;
use icehouse::plan::expr::ScalarExpr;
use icehouse::plan::step::{
    AggregateDescription, AggregateFunctionResolver, AggregatingStep, Assignments, ColumnWithType,
    JoinStep, PlanStep, ProjectionStep, SourceStep,
};
use icehouse::plan::symbol::SymbolAllocator;

fn source(arena: &mut PlanArena, columns: &[(&str, DataType)]) -> PlanNodeId {
    let columns = columns
        .iter()
        .map(|(name, data_type)| ColumnWithType::new(*name, data_type.clone()))
        .collect();
    arena
        .add(PlanStep::Source(SourceStep::new(columns)), vec![])
        .expect("add source")
}

fn agg(name: &str, arg: &str, arg_type: DataType, output: &str) -> AggregateDescription {
    let function = BuiltinAggregateResolver
        .resolve(name, &[arg_type], &[])
        .expect("resolve aggregate");
    AggregateDescription {
        function,
        parameters: vec![],
        argument_names: vec![arg.to_string()],
        output_column_name: output.to_string(),
    }
}

fn stats(row_count: u64, symbols: &[(&str, u64)]) -> PlanNodeStatistics {
    PlanNodeStatistics {
        row_count,
        symbol_statistics: symbols
            .iter()
            .map(|(name, ndv)| {
                (
                    name.to_string(),
                    SymbolStatistics {
                        ndv: *ndv,
                        nulls_count: 0,
                    },
                )
            })
            .collect(),
    }
}

fn run_rule(
    arena: &mut PlanArena,
    root: PlanNodeId,
    settings: &OptimizerConfig,
    estimator: &dyn CardinalityEstimator,
) -> Option<PlanNodeId> {
    let symbols = SymbolAllocator::with_reserved(arena.all_stream_names().collect::<Vec<_>>());
    let ctx = RuleContext {
        settings,
        estimator,
        resolver: &BuiltinAggregateResolver,
        symbols: &symbols,
    };
    EagerAggregation
        .transform(arena, root, &ctx)
        .expect("transform")
}

/// Agg[k=a, sum(x)] over Join(a=b) with a, x from the left side.
fn simple_sum_plan(arena: &mut PlanArena) -> (PlanNodeId, PlanNodeId, PlanNodeId, PlanNodeId) {
    let left = source(arena, &[("a", DataType::Int64), ("x", DataType::Int64)]);
    let right = source(arena, &[("b", DataType::Int64), ("y", DataType::Int64)]);
    let join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["b".to_string()],
            )),
            vec![left, right],
        )
        .expect("add join");
    let root = arena
        .add(
            PlanStep::Aggregating(AggregatingStep::new(
                vec!["a".to_string()],
                vec![agg("sum", "x", DataType::Int64, "s")],
                true,
            )),
            vec![join],
        )
        .expect("add agg");
    (root, join, left, right)
}

#[test]
fn sum_is_pushed_below_the_join() {
    let mut arena = PlanArena::new();
    let (root, join, left, right) = simple_sum_plan(&mut arena);
    let schema_before = arena.node(root).expect("root").stream.clone();

    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(1000, &[("a", 10)]));

    let settings = OptimizerConfig::default();
    let result = run_rule(&mut arena, root, &settings, &estimator);
    assert_eq!(result, Some(root));

    // The top aggregate's output schema is unchanged.
    assert_eq!(arena.node(root).expect("root").stream, schema_before);

    // A local aggregate now feeds the left join input.
    let join_node = arena.node(join).expect("join");
    let local = arena.node(join_node.children[0]).expect("local agg");
    let PlanStep::Aggregating(local_step) = &local.step else {
        panic!("expected local aggregate below the join");
    };
    assert_eq!(local_step.keys, ["a"]);
    assert_eq!(local_step.aggregates.len(), 1);
    assert_eq!(local_step.aggregates[0].function.name, "sum");
    assert_eq!(local_step.aggregates[0].argument_names, ["x"]);
    assert!(local_step.aggregates[0].output_column_name.starts_with("inter#x"));
    assert_eq!(local.children, [left]);
    assert_eq!(join_node.children[1], right);

    // The upper aggregate consumes the intermediate under its fresh name.
    let PlanStep::Aggregating(top_step) = &arena.node(root).expect("root").step else {
        panic!("expected aggregating root");
    };
    assert_eq!(top_step.keys, ["a"]);
    assert_eq!(top_step.aggregates[0].function.name, "sum");
    assert_eq!(
        top_step.aggregates[0].argument_names,
        [local_step.aggregates[0].output_column_name.clone()]
    );
    assert_eq!(top_step.aggregates[0].output_column_name, "s");
}

#[test]
fn uniq_exact_splits_into_state_and_merge() {
    let mut arena = PlanArena::new();
    let left = source(&mut arena, &[("a", DataType::Int64), ("x", DataType::Int64)]);
    let right = source(&mut arena, &[("b", DataType::Int64)]);
    let join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["b".to_string()],
            )),
            vec![left, right],
        )
        .expect("add join");
    let root = arena
        .add(
            PlanStep::Aggregating(AggregatingStep::new(
                vec!["a".to_string()],
                vec![agg("uniqExact", "x", DataType::Int64, "u")],
                true,
            )),
            vec![join],
        )
        .expect("add agg");
    let schema_before = arena.node(root).expect("root").stream.clone();
    assert_eq!(schema_before.type_of("u"), Some(&DataType::UInt64));

    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(100_000, &[("a", 7)]));

    let result = run_rule(&mut arena, root, &OptimizerConfig::default(), &estimator);
    assert_eq!(result, Some(root));
    assert_eq!(arena.node(root).expect("root").stream, schema_before);

    let join_node = arena.node(join).expect("join");
    let local = arena.node(join_node.children[0]).expect("local agg");
    let PlanStep::Aggregating(local_step) = &local.step else {
        panic!("expected local aggregate");
    };
    assert_eq!(local_step.aggregates[0].function.name, "uniqExactState");
    assert_eq!(local_step.aggregates[0].function.result_type, DataType::Binary);

    let PlanStep::Aggregating(top_step) = &arena.node(root).expect("root").step else {
        panic!("expected aggregating root");
    };
    assert_eq!(top_step.aggregates[0].function.name, "uniqExactMerge");
    assert_eq!(top_step.aggregates[0].function.result_type, DataType::UInt64);
}

#[test]
fn multi_if_argument_decomposes_through_the_projection() {
    let mut arena = PlanArena::new();
    let left = source(
        &mut arena,
        &[
            ("a", DataType::Int64),
            ("tag", DataType::Utf8),
            ("v1", DataType::Int64),
        ],
    );
    let right = source(&mut arena, &[("b", DataType::Int64), ("v2", DataType::Int64)]);
    let join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["b".to_string()],
            )),
            vec![left, right],
        )
        .expect("add join");

    let multi_if = ScalarExpr::call(
        "multiIf",
        vec![
            ScalarExpr::call(
                "equals",
                vec![
                    ScalarExpr::column("tag"),
                    ScalarExpr::literal("L", DataType::Utf8),
                ],
            ),
            ScalarExpr::column("v1"),
            ScalarExpr::column("v2"),
        ],
    );
    let projection = arena
        .add(
            PlanStep::Projection(ProjectionStep::new(
                Assignments::new(vec![
                    ("a".to_string(), ScalarExpr::column("a")),
                    ("v".to_string(), multi_if),
                ]),
                HashMap::from([
                    ("a".to_string(), DataType::Int64),
                    ("v".to_string(), DataType::Int64),
                ]),
            )),
            vec![join],
        )
        .expect("add projection");
    let root = arena
        .add(
            PlanStep::Aggregating(AggregatingStep::new(
                vec!["a".to_string()],
                vec![agg("sum", "v", DataType::Int64, "s")],
                true,
            )),
            vec![projection],
        )
        .expect("add agg");
    let schema_before = arena.node(root).expect("root").stream.clone();

    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(2_000_000, &[("a", 50), ("tag", 2)]));

    let result = run_rule(&mut arena, root, &OptimizerConfig::default(), &estimator);
    assert_eq!(result, Some(root));
    assert_eq!(arena.node(root).expect("root").stream, schema_before);

    // sum(v1) moved below the left join input, grouped by the key and the
    // condition column the projection still needs.
    let join_node = arena.node(join).expect("join");
    let local = arena.node(join_node.children[0]).expect("local agg");
    let PlanStep::Aggregating(local_step) = &local.step else {
        panic!("expected local aggregate");
    };
    assert_eq!(local_step.keys, ["a", "tag"]);
    assert_eq!(local_step.aggregates.len(), 1);
    assert_eq!(local_step.aggregates[0].argument_names, ["v1"]);
    let intermediate = local_step.aggregates[0].output_column_name.clone();
    assert!(intermediate.starts_with("inter#v1"));

    // The projection above the join now selects the intermediate in the
    // then-branch; the untouched right column stays.
    let root_node = arena.node(root).expect("root");
    let projection_node = arena.node(root_node.children[0]).expect("projection");
    let PlanStep::Projection(projection_step) = &projection_node.step else {
        panic!("expected projection above the join");
    };
    let rewritten = projection_step.assignments.get("v").expect("v assignment");
    let ScalarExpr::Function { name, args } = rewritten else {
        panic!("v must stay a multiIf call");
    };
    assert_eq!(name, "multiIf");
    assert_eq!(args[1], ScalarExpr::column(intermediate));
    assert_eq!(args[2], ScalarExpr::column("v2"));

    // The top aggregate is untouched: sum is self-mergeable.
    let PlanStep::Aggregating(top_step) = &root_node.step else {
        panic!("expected aggregating root");
    };
    assert_eq!(top_step.aggregates[0].argument_names, ["v"]);
}

#[test]
fn search_descends_to_the_deepest_join() {
    let mut arena = PlanArena::new();
    let leaf = source(&mut arena, &[("a", DataType::Int64), ("x", DataType::Int64)]);
    let mid = source(&mut arena, &[("b", DataType::Int64)]);
    let inner_join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["b".to_string()],
            )),
            vec![leaf, mid],
        )
        .expect("add inner join");
    let right = source(&mut arena, &[("c", DataType::Int64)]);
    let outer_join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["c".to_string()],
            )),
            vec![inner_join, right],
        )
        .expect("add outer join");
    let root = arena
        .add(
            PlanStep::Aggregating(AggregatingStep::new(
                vec!["a".to_string()],
                vec![agg("sum", "x", DataType::Int64, "s")],
                true,
            )),
            vec![outer_join],
        )
        .expect("add agg");

    let mut estimator = FixedStatistics::new();
    estimator.insert(leaf, stats(5_000_000, &[("a", 100)]));

    let result = run_rule(&mut arena, root, &OptimizerConfig::default(), &estimator);
    assert_eq!(result, Some(root));

    // The local aggregate sits directly above the deepest join's left input.
    let inner = arena.node(inner_join).expect("inner join");
    let local = arena.node(inner.children[0]).expect("local agg");
    assert!(local.step.is_aggregating());
    assert_eq!(local.children, [leaf]);

    // The outer join's shape is untouched apart from the new stream.
    let outer = arena.node(outer_join).expect("outer join");
    assert_eq!(outer.children[0], inner_join);
    assert_eq!(outer.children[1], right);
}

#[test]
fn every_join_setting_stops_at_the_first_join() {
    let mut arena = PlanArena::new();
    let leaf = source(&mut arena, &[("a", DataType::Int64), ("x", DataType::Int64)]);
    let mid = source(&mut arena, &[("b", DataType::Int64)]);
    let inner_join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["b".to_string()],
            )),
            vec![leaf, mid],
        )
        .expect("add inner join");
    let right = source(&mut arena, &[("c", DataType::Int64)]);
    let outer_join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["c".to_string()],
            )),
            vec![inner_join, right],
        )
        .expect("add outer join");
    let root = arena
        .add(
            PlanStep::Aggregating(AggregatingStep::new(
                vec!["a".to_string()],
                vec![agg("sum", "x", DataType::Int64, "s")],
                true,
            )),
            vec![outer_join],
        )
        .expect("add agg");

    let mut estimator = FixedStatistics::new();
    estimator.insert(inner_join, stats(5_000_000, &[("a", 100)]));

    let settings = OptimizerConfig {
        agg_push_down_every_join: true,
        ..OptimizerConfig::default()
    };
    let result = run_rule(&mut arena, root, &settings, &estimator);
    assert_eq!(result, Some(root));

    // The local aggregate lands directly below the first join.
    let outer = arena.node(outer_join).expect("outer join");
    let local = arena.node(outer.children[0]).expect("local agg");
    assert!(local.step.is_aggregating());
    assert_eq!(local.children, [inner_join]);
}

#[test]
fn refusals_leave_the_plan_untouched() {
    // Cost gate not met: predicted reduction is below the threshold.
    let mut arena = PlanArena::new();
    let (root, join, left, _) = simple_sum_plan(&mut arena);
    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(1000, &[("a", 900)]));
    assert_eq!(run_rule(&mut arena, root, &OptimizerConfig::default(), &estimator), None);
    assert!(arena.node(join).expect("join").children.iter().all(|c| {
        !arena.node(*c).expect("child").step.is_aggregating()
    }));

    // No statistics at all: only a zero threshold lets the rewrite through.
    let mut arena = PlanArena::new();
    let (root, _, _, _) = simple_sum_plan(&mut arena);
    assert_eq!(run_rule(&mut arena, root, &OptimizerConfig::default(), &NoStatistics), None);

    let mut arena = PlanArena::new();
    let (root, _, _, _) = simple_sum_plan(&mut arena);
    let settings = OptimizerConfig {
        agg_push_down_threshold: 0.0,
        ..OptimizerConfig::default()
    };
    assert_eq!(run_rule(&mut arena, root, &settings, &NoStatistics), Some(root));

    // An unknown aggregate class refuses the whole rewrite.
    let mut arena = PlanArena::new();
    let left = source(&mut arena, &[("a", DataType::Int64), ("x", DataType::Int64)]);
    let right = source(&mut arena, &[("b", DataType::Int64)]);
    let join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["b".to_string()],
            )),
            vec![left, right],
        )
        .expect("add join");
    let unknown = AggregateDescription {
        function: icehouse::plan::step::AggregateFunction {
            name: "median".to_string(),
            result_type: DataType::Float64,
        },
        parameters: vec![],
        argument_names: vec!["x".to_string()],
        output_column_name: "m".to_string(),
    };
    let root = arena
        .add(
            PlanStep::Aggregating(AggregatingStep::new(vec!["a".to_string()], vec![unknown], true)),
            vec![join],
        )
        .expect("add agg");
    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(1000, &[("a", 2)]));
    assert_eq!(run_rule(&mut arena, root, &OptimizerConfig::default(), &estimator), None);
}

#[test]
fn block_and_allow_lists_take_precedence() {
    // Blocklisted join id refuses even a profitable push.
    let mut arena = PlanArena::new();
    let (root, join, left, _) = simple_sum_plan(&mut arena);
    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(1_000_000, &[("a", 3)]));
    let settings = OptimizerConfig {
        eager_agg_join_id_blocklist: join.to_string(),
        ..OptimizerConfig::default()
    };
    assert_eq!(run_rule(&mut arena, root, &settings, &estimator), None);

    // A whitelist entry approves without consulting statistics.
    let mut arena = PlanArena::new();
    let (root, join, _, _) = simple_sum_plan(&mut arena);
    let settings = OptimizerConfig {
        eager_agg_join_id_whitelist: format!("{}-0", join),
        ..OptimizerConfig::default()
    };
    assert_eq!(run_rule(&mut arena, root, &settings, &NoStatistics), Some(root));

    // The whitelist restricts to the named child index.
    let mut arena = PlanArena::new();
    let (root, join, left, _) = simple_sum_plan(&mut arena);
    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(1_000_000, &[("a", 3)]));
    let settings = OptimizerConfig {
        eager_agg_join_id_whitelist: format!("{}-1", join),
        ..OptimizerConfig::default()
    };
    assert_eq!(run_rule(&mut arena, root, &settings, &estimator), None);
}

#[test]
fn introduced_symbols_are_fresh() {
    let mut arena = PlanArena::new();
    // A column already named like an intermediate must not collide.
    let left = source(
        &mut arena,
        &[
            ("a", DataType::Int64),
            ("x", DataType::Int64),
            ("inter#x", DataType::Int64),
        ],
    );
    let right = source(&mut arena, &[("b", DataType::Int64)]);
    let join = arena
        .add(
            PlanStep::Join(JoinStep::inner(
                vec!["a".to_string()],
                vec!["b".to_string()],
            )),
            vec![left, right],
        )
        .expect("add join");
    let root = arena
        .add(
            PlanStep::Aggregating(AggregatingStep::new(
                vec!["a".to_string()],
                vec![agg("sum", "x", DataType::Int64, "s")],
                true,
            )),
            vec![join],
        )
        .expect("add agg");

    let mut estimator = FixedStatistics::new();
    estimator.insert(left, stats(10_000, &[("a", 4)]));

    let result = run_rule(&mut arena, root, &OptimizerConfig::default(), &estimator);
    assert_eq!(result, Some(root));

    let PlanStep::Aggregating(top_step) = &arena.node(root).expect("root").step else {
        panic!("expected aggregating root");
    };
    let new_name = &top_step.aggregates[0].argument_names[0];
    assert!(new_name.starts_with("inter#x"));
    assert_ne!(new_name, "inter#x");
}
