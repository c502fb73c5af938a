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
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::common::app_config::OptimizerConfig;
use crate::common::ids::PlanNodeId;
use crate::icehouse_logging::debug;
use crate::optimizer::agg_class::{AggFuncClass, class_of_agg_func, merge_name, state_name};
use crate::optimizer::cardinality::CardinalityEstimator;
use crate::plan::expr::{ScalarExpr, is_identity};
use crate::plan::step::{
    AggregateDescription, AggregateFunctionResolver, AggregatingStep, Assignments, PlanStep,
    ProjectionStep, format_aggregates,
};
use crate::plan::symbol::{SymbolAllocator, SymbolMapper, contains_all};
use crate::plan::{PlanArena, PlanNode};

/// Everything the rule needs from its surroundings.
pub struct RuleContext<'a> {
    pub settings: &'a OptimizerConfig,
    pub estimator: &'a dyn CardinalityEstimator,
    pub resolver: &'a dyn AggregateFunctionResolver,
    pub symbols: &'a SymbolAllocator,
}

/// Pushes an aggregation below a join chain when the pushed aggregate shrinks
/// the join input enough, reconstructing the original aggregate above the
/// join through state/merge decomposition.
///
/// Expected refusals (unknown function class, key on neither side, cost gate
/// not met) return `Ok(None)` and leave the plan untouched.
pub struct EagerAggregation;

/// Candidate insertion point found by the bottom-join search.
#[derive(Clone, Debug)]
pub struct LocalGroupByTarget {
    pub bottom_join: PlanNodeId,
    pub bottom_join_child_index: usize,
    pub aggregates: Vec<AggregateDescription>,
    pub keys: Vec<String>,
    pub join_layer: u32,
    pub push_through_final_projection: bool,
}

type LocalGroupByTargetMap = BTreeMap<PlanNodeId, LocalGroupByTarget>;

struct AggJoinDecomposition {
    composed: Vec<AggregateDescription>,
    s1: Vec<AggregateDescription>,
    s2: Vec<AggregateDescription>,
    g1: Vec<String>,
    g2: Vec<String>,
}

fn decompose_agg_join(
    agg_descs: &[AggregateDescription],
    group_by_keys: &HashSet<String>,
    names_from_left: &HashSet<String>,
    names_from_right: &HashSet<String>,
) -> Option<AggJoinDecomposition> {
    let mut out = AggJoinDecomposition {
        composed: Vec::new(),
        s1: Vec::new(),
        s2: Vec::new(),
        g1: Vec::new(),
        g2: Vec::new(),
    };

    for aggregator in agg_descs {
        if class_of_agg_func(&aggregator.function.name) == AggFuncClass::Unknown {
            return None;
        }
        if contains_all(names_from_left, &aggregator.argument_names) {
            // Pushing an aggregate over its own group key is a no-op.
            if aggregator.argument_names.len() == 1
                && !group_by_keys.contains(&aggregator.argument_names[0])
            {
                out.s1.push(aggregator.clone());
            }
        } else if contains_all(names_from_right, &aggregator.argument_names) {
            if aggregator.argument_names.len() == 1
                && !group_by_keys.contains(&aggregator.argument_names[0])
            {
                out.s2.push(aggregator.clone());
            }
        } else {
            out.composed.push(aggregator.clone());
        }
    }

    for group_key in group_by_keys {
        if names_from_left.contains(group_key) {
            out.g1.push(group_key.clone());
        } else if names_from_right.contains(group_key) {
            out.g2.push(group_key.clone());
        } else {
            return None;
        }
    }
    out.g1.sort();
    out.g2.sort();

    Some(out)
}

#[derive(Default)]
struct ProjectionDecomposition {
    /// Global argument name -> fresh `inter#` name, per join side.
    rename_from_left: HashMap<String, String>,
    rename_from_right: HashMap<String, String>,
    /// Non-empty means the whole projection can be pushed below the join.
    projection_require_symbols: BTreeSet<String>,
    projection_gene_symbols: HashSet<String>,
}

fn decompose_projection(
    projection_step: &ProjectionStep,
    composed_aggregates: &[AggregateDescription],
    group_by_keys: &HashSet<String>,
    names_from_left: &HashSet<String>,
    names_from_right: &HashSet<String>,
    s1: &mut Vec<AggregateDescription>,
    s2: &mut Vec<AggregateDescription>,
    symbol_allocator: &SymbolAllocator,
) -> Option<ProjectionDecomposition> {
    let mut out = ProjectionDecomposition::default();
    let assignments = &projection_step.assignments;
    let mut deep_parse_success = false;

    // The projection where a new sub agg can be extracted.
    for agg_desc in composed_aggregates {
        if agg_desc.argument_names.len() != 1 {
            continue;
        }
        let the_only_argument_name = &agg_desc.argument_names[0];
        let Some(expr) = assignments.get(the_only_argument_name) else {
            continue;
        };
        let ScalarExpr::Function { name, args } = expr else {
            continue;
        };
        if !name.eq_ignore_ascii_case("multiif") || args.len() <= 2 {
            continue;
        }
        let Some(decomposed_argument_name) = args[1].as_column() else {
            continue;
        };
        let decomposed_argument_name = decomposed_argument_name.to_string();

        // Avoid producing duplicate entries in the local aggregate.
        if out.rename_from_left.contains_key(&decomposed_argument_name)
            || out.rename_from_right.contains_key(&decomposed_argument_name)
            || group_by_keys.contains(&decomposed_argument_name)
        {
            continue;
        }

        let new_decomposed_argument_name =
            symbol_allocator.new_symbol(&format!("inter#{}", decomposed_argument_name));
        deep_parse_success = true;

        let mut pushed = agg_desc.clone();
        pushed.argument_names = vec![decomposed_argument_name.clone()];
        pushed.output_column_name = new_decomposed_argument_name.clone();

        if names_from_left.contains(&decomposed_argument_name) {
            s1.push(pushed.clone());
            out.rename_from_left
                .insert(decomposed_argument_name.clone(), new_decomposed_argument_name.clone());
        }
        if names_from_right.contains(&decomposed_argument_name) {
            s2.push(pushed);
            out.rename_from_right
                .insert(decomposed_argument_name, new_decomposed_argument_name);
        }
    }

    if deep_parse_success {
        return Some(out);
    }

    // Projection that can be fully pushed down to one join side.
    let mut left_cnt = 0usize;
    let mut right_cnt = 0usize;
    let mut total_cnt = 0usize;
    for (name, expr) in assignments.iter() {
        if is_identity(name, expr) {
            continue;
        }
        total_cnt += 1;

        let symbols = expr.collect_symbols();
        if contains_all(names_from_left, &symbols) {
            left_cnt += 1;
        } else if contains_all(names_from_right, &symbols) {
            right_cnt += 1;
        }
        if left_cnt > 0 && right_cnt > 0 {
            break;
        }
        out.projection_require_symbols.extend(symbols);
        out.projection_gene_symbols.insert(name.clone());
    }

    if left_cnt != total_cnt && right_cnt != total_cnt {
        return None;
    }

    for agg_desc in composed_aggregates {
        let Some(the_only_argument_name) = agg_desc.argument_names.first() else {
            continue;
        };
        if !assignments.contains(the_only_argument_name) {
            continue;
        }
        if out.rename_from_left.contains_key(the_only_argument_name)
            || out.rename_from_right.contains_key(the_only_argument_name)
        {
            continue;
        }
        if left_cnt > 0 {
            s1.push(agg_desc.clone());
        }
        if right_cnt > 0 {
            s2.push(agg_desc.clone());
        }
    }
    Some(out)
}

/// Re-filter the pushed aggregates and keys after stepping to one join side.
/// `None` prunes this side: some aggregate can no longer be computed there.
fn update_agg_s0_g0(
    mut names_from_one_side: HashSet<String>,
    projection_gene_symbols: &HashSet<String>,
    s0: &[AggregateDescription],
    g0: &[String],
) -> Option<(Vec<AggregateDescription>, Vec<String>)> {
    names_from_one_side.extend(projection_gene_symbols.iter().cloned());

    let mut new_s0 = Vec::with_capacity(s0.len());
    for agg in s0 {
        let function_type = class_of_agg_func(&agg.function.name);

        // A pushed aggregate needs exactly one argument, otherwise there is
        // no way to tell which side it belongs to.
        if function_type != AggFuncClass::Unknown
            && agg.argument_names.len() == 1
            && contains_all(&names_from_one_side, &agg.argument_names)
        {
            new_s0.push(agg.clone());
        } else {
            return None;
        }
    }

    let new_g0 = g0
        .iter()
        .filter(|key| names_from_one_side.contains(*key))
        .cloned()
        .collect();

    Some((new_s0, new_g0))
}

struct BottomJoinSearch<'a> {
    arena: &'a PlanArena,
    settings: &'a OptimizerConfig,
    projection: Option<PlanNodeId>,
    projection_require_symbols: &'a BTreeSet<String>,
    projection_gene_symbols: &'a HashSet<String>,
    init_require_output_names: &'a HashSet<String>,
    global_argument_name_to_local_from_projection: &'a HashMap<String, String>,
    has_visit_first_join: bool,
    result: LocalGroupByTargetMap,
}

impl<'a> BottomJoinSearch<'a> {
    fn join_step(node: &PlanNode) -> Result<&crate::plan::step::JoinStep, String> {
        match &node.step {
            PlanStep::Join(step) => Ok(step),
            other => Err(format!("expected join step, got {:?}", other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn find(
        &mut self,
        mut require_output_names: HashSet<String>,
        join: PlanNodeId,
        index: usize,
        s0: Vec<AggregateDescription>,
        g0: Vec<String>,
        join_layer: u32,
        mut proj_rename: HashMap<String, String>,
    ) -> Result<(), String> {
        let child = self.arena.child(join, index)?;

        // Try to thread the aggregate through a projection sitting between
        // two joins: every non-identity assignment must rename exactly one
        // input symbol.
        if child.step.is_projection()
            && proj_rename.is_empty()
            && !child.children.is_empty()
            && self.arena.node_ok(child.children[0])?.step.is_join()
        {
            let PlanStep::Projection(projection_step) = &child.step else {
                unreachable!()
            };
            let next_join_id = child.children[0];

            for (name, expr) in projection_step.assignments.iter() {
                if !is_identity(name, expr) {
                    let symbols = expr.collect_symbols();
                    if symbols.len() != 1 {
                        proj_rename.clear();
                        break;
                    }
                    proj_rename.insert(
                        name.clone(),
                        symbols.into_iter().next().expect("single symbol"),
                    );
                }
            }
            if !proj_rename.is_empty() {
                let next_join = self.arena.node_ok(next_join_id)?;
                let second_join_step = Self::join_step(next_join)?;
                if let Some(filter) = &second_join_step.filter {
                    require_output_names.extend(filter.collect_symbols());
                }
                require_output_names.extend(second_join_step.left_keys.iter().cloned());
                require_output_names.extend(second_join_step.right_keys.iter().cloned());

                let second_names_from_left =
                    self.arena.node_ok(next_join.children[0])?.stream.name_set();
                let second_names_from_right =
                    self.arena.node_ok(next_join.children[1])?.stream.name_set();

                let old_result_size = self.result.len();
                if let Some((new_s0, new_g0)) = update_agg_s0_g0(
                    second_names_from_left,
                    self.projection_gene_symbols,
                    &s0,
                    &g0,
                ) {
                    self.find(
                        require_output_names.clone(),
                        next_join_id,
                        0,
                        new_s0,
                        new_g0,
                        join_layer,
                        proj_rename.clone(),
                    )?;
                }
                if old_result_size == self.result.len() {
                    if let Some((new_s0, new_g0)) = update_agg_s0_g0(
                        second_names_from_right,
                        self.projection_gene_symbols,
                        &s0,
                        &g0,
                    ) {
                        self.find(
                            require_output_names,
                            next_join_id,
                            1,
                            new_s0,
                            new_g0,
                            join_layer,
                            proj_rename,
                        )?;
                    }
                }
                return Ok(());
            }
        }

        if !child.step.is_join() || self.has_visit_first_join {
            return self.finalize_candidate(
                require_output_names,
                join,
                index,
                s0,
                g0,
                join_layer,
                proj_rename,
            );
        }

        if self.settings.agg_push_down_every_join {
            self.has_visit_first_join = true;
        }

        let second_join_id = child.id;
        let second_join = self.arena.node_ok(second_join_id)?;
        let second_join_step = Self::join_step(second_join)?;

        if let Some(filter) = &second_join_step.filter {
            require_output_names.extend(filter.collect_symbols());
        }
        require_output_names.extend(second_join_step.left_keys.iter().cloned());
        require_output_names.extend(second_join_step.right_keys.iter().cloned());

        let second_names_from_left = self
            .arena
            .node_ok(second_join.children[0])?
            .stream
            .name_set();
        let second_names_from_right = self
            .arena
            .node_ok(second_join.children[1])?
            .stream
            .name_set();

        if !self.projection_require_symbols.is_empty() {
            // Pattern 1: push full projection + sub agg.
            let old_result_size = self.result.len();
            if contains_all(&second_names_from_left, self.projection_require_symbols) {
                if let Some((new_s0, new_g0)) = update_agg_s0_g0(
                    second_names_from_left,
                    self.projection_gene_symbols,
                    &s0,
                    &g0,
                ) {
                    self.find(
                        require_output_names.clone(),
                        second_join_id,
                        0,
                        new_s0,
                        new_g0,
                        join_layer + 1,
                        proj_rename.clone(),
                    )?;
                }
            }
            if old_result_size == self.result.len()
                && contains_all(&second_names_from_right, self.projection_require_symbols)
            {
                if let Some((new_s0, new_g0)) = update_agg_s0_g0(
                    second_names_from_right,
                    self.projection_gene_symbols,
                    &s0,
                    &g0,
                ) {
                    self.find(
                        require_output_names,
                        second_join_id,
                        1,
                        new_s0,
                        new_g0,
                        join_layer + 1,
                        proj_rename,
                    )?;
                }
            }
        } else {
            // Pattern 2: only push sub agg. Never stack a pushed aggregate
            // on a child that already aggregates.
            let old_result_size = self.result.len();
            if !self
                .arena
                .node_ok(second_join.children[0])?
                .step
                .is_aggregating()
            {
                if let Some((new_s0, new_g0)) =
                    update_agg_s0_g0(second_names_from_left, &HashSet::new(), &s0, &g0)
                {
                    self.find(
                        require_output_names.clone(),
                        second_join_id,
                        0,
                        new_s0,
                        new_g0,
                        join_layer + 1,
                        proj_rename.clone(),
                    )?;
                }
            }
            if old_result_size == self.result.len()
                && !self
                    .arena
                    .node_ok(second_join.children[1])?
                    .step
                    .is_aggregating()
            {
                if let Some((new_s0, new_g0)) =
                    update_agg_s0_g0(second_names_from_right, &HashSet::new(), &s0, &g0)
                {
                    self.find(
                        require_output_names,
                        second_join_id,
                        1,
                        new_s0,
                        new_g0,
                        join_layer + 1,
                        proj_rename,
                    )?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize_candidate(
        &mut self,
        mut require_output_names: HashSet<String>,
        join: PlanNodeId,
        index: usize,
        s0: Vec<AggregateDescription>,
        mut g0: Vec<String>,
        join_layer: u32,
        proj_rename: HashMap<String, String>,
    ) -> Result<(), String> {
        let child = self.arena.child(join, index)?;
        let mut c1 = child.stream.names();
        if !self.projection_gene_symbols.is_empty() {
            let projection = self
                .projection
                .ok_or_else(|| "projection symbols without a projection node".to_string())?;
            let PlanStep::Projection(proj_step) = &self.arena.node_ok(projection)?.step else {
                return Err("projection node lost its step".to_string());
            };
            for (name, expr) in proj_step.assignments.iter() {
                if !is_identity(name, expr) {
                    c1.push(name.clone());
                }
            }
        }

        require_output_names.extend(self.init_require_output_names.iter().cloned());

        let mut global_agg_needs = HashSet::new();
        for aggregator in &s0 {
            global_agg_needs.insert(aggregator.output_column_name.clone());
            for argument_name in &aggregator.argument_names {
                global_agg_needs.insert(argument_name.clone());
            }
        }

        // The upper aggregate may group by a projected expression; the local
        // aggregate must keep the origin column that feeds it.
        for (expr_name, origin_column) in &proj_rename {
            if require_output_names.remove(expr_name) {
                require_output_names.insert(origin_column.clone());
            }
        }

        c1.retain(|v| require_output_names.contains(v));
        if !s0.is_empty() {
            c1.retain(|v| {
                !self
                    .global_argument_name_to_local_from_projection
                    .contains_key(v)
            });
        }
        c1.retain(|v| !global_agg_needs.contains(v));

        g0.extend(c1);
        g0.sort();
        g0.dedup();

        debug!(
            "collect local group by target, join_id={}, index={}, keys={}, aggs={}",
            join,
            index,
            g0.join(","),
            format_aggregates(&s0)
        );
        self.result.insert(
            join,
            LocalGroupByTarget {
                bottom_join: join,
                bottom_join_child_index: index,
                aggregates: s0,
                keys: g0,
                join_layer,
                push_through_final_projection: !proj_rename.is_empty(),
            },
        );
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn determine_bottom_join(
    arena: &PlanArena,
    parent_of_first_join: PlanNodeId,
    projection: Option<PlanNodeId>,
    init_s0: Vec<AggregateDescription>,
    init_g0: Vec<String>,
    projection_require_symbols: &BTreeSet<String>,
    projection_gene_symbols: &HashSet<String>,
    init_require_output_names: &HashSet<String>,
    global_argument_name_to_local_from_projection: &HashMap<String, String>,
    settings: &OptimizerConfig,
) -> Result<LocalGroupByTargetMap, String> {
    let mut search = BottomJoinSearch {
        arena,
        settings,
        projection,
        projection_require_symbols,
        projection_gene_symbols,
        init_require_output_names,
        global_argument_name_to_local_from_projection,
        has_visit_first_join: false,
        result: LocalGroupByTargetMap::new(),
    };
    search.find(
        HashSet::new(),
        parent_of_first_join,
        0,
        init_s0,
        init_g0,
        0,
        HashMap::new(),
    )?;
    Ok(search.result)
}

fn list_has(list: &str, wanted: &str) -> bool {
    list.split(',').any(|item| item.trim() == wanted)
}

fn list_is_empty(list: &str) -> bool {
    list.split(',').all(|item| item.trim().is_empty())
}

fn can_agg_push_down(
    target: &LocalGroupByTarget,
    arena: &PlanArena,
    ctx: &RuleContext<'_>,
) -> Result<bool, String> {
    debug!(
        "judge local group by target, join_id={}, index={}, keys={}, aggs={}, join_layer={}, push_through_final_projection={}",
        target.bottom_join,
        target.bottom_join_child_index,
        target.keys.join(","),
        format_aggregates(&target.aggregates),
        target.join_layer,
        target.push_through_final_projection
    );

    let settings = ctx.settings;
    if list_has(
        &settings.eager_agg_join_id_blocklist,
        &target.bottom_join.to_string(),
    ) {
        return Ok(false);
    }

    if !list_is_empty(&settings.eager_agg_join_id_whitelist) {
        let wanted = format!("{}-{}", target.bottom_join, target.bottom_join_child_index);
        return Ok(list_has(&settings.eager_agg_join_id_whitelist, &wanted));
    }

    let bottom_node = arena.child(target.bottom_join, target.bottom_join_child_index)?;
    let Some(child_stats) = ctx.estimator.estimate(arena, bottom_node.id) else {
        return Ok(settings.agg_push_down_threshold == 0.0);
    };

    let mut all_unknown = true;
    let mut cndvs: Vec<f64> = Vec::new();
    for key in &target.keys {
        if let Some(key_stats) = child_stats.symbol(key) {
            if key_stats.is_unknown() {
                continue;
            }
            let null_rows = if child_stats.row_count == 0
                || key_stats.nulls_count as f64 / child_stats.row_count as f64 == 0.0
            {
                0.0
            } else {
                1.0
            };
            if key_stats.ndv > 0 {
                cndvs.push(key_stats.ndv as f64 + null_rows);
            }
            all_unknown = false;
        }
    }
    if all_unknown {
        return Ok(false);
    }

    cndvs.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut row_count = 1.0f64;
    for (i, cndv) in cndvs.iter().copied().enumerate() {
        if i != 0 {
            if !target.keys.is_empty() && child_stats.row_count > 1_000_000 {
                // Treat a tiny trailing key as correlated with the leader.
                if row_count * cndv > child_stats.row_count as f64 && cndv < cndvs[0] * 0.001 {
                    continue;
                }
            }
            row_count *= (settings.multi_agg_keys_correlated_coefficient * cndv).max(1.0);
        } else {
            row_count *= cndv;
        }
    }

    row_count = row_count.min(child_stats.row_count as f64);

    if settings.only_push_agg_with_functions && target.aggregates.is_empty() {
        return Ok(false);
    }

    debug!(
        "pushdown gate, agg_size={}, group_by_keys_size={}, new_row_count={}, old_row_count={}, ratio={}",
        target.aggregates.len(),
        target.keys.len(),
        row_count,
        child_stats.row_count,
        child_stats.row_count as f64 / row_count
    );
    Ok(child_stats.row_count as f64 / row_count > settings.agg_push_down_threshold)
}

fn create_local_aggregate(
    s0: &[AggregateDescription],
    g0: &[String],
) -> AggregatingStep {
    debug!(
        "create local agg={}, keys={}",
        format_aggregates(s0),
        g0.join(",")
    );
    AggregatingStep::new(g0.to_vec(), s0.to_vec(), true)
}

struct PlanRewriter<'a, 'b> {
    arena: &'a mut PlanArena,
    ctx: &'a RuleContext<'b>,
    s1: &'a [AggregateDescription],
    g1: &'a [String],
    push_projection: bool,
    bottom_join_id: PlanNodeId,
    bottom_join_child_index: usize,
    push_through_final_projection: bool,
    mapper: SymbolMapper,
    has_visit_global_agg: bool,
    has_visit_join: bool,
    proj: Option<PlanNodeId>,
}

impl PlanRewriter<'_, '_> {
    fn update_until_bottom_join(&mut self, current: PlanNodeId) -> Result<PlanNodeId, String> {
        let node = self.arena.node_ok(current)?.clone();
        match &node.step {
            PlanStep::Aggregating(agg_step) => {
                if self.has_visit_global_agg {
                    return Ok(current);
                }
                self.has_visit_global_agg = true;

                let child = self.update_until_bottom_join(node.children[0])?;
                let child_types = self.arena.node_ok(child)?.stream.name_to_type();

                let mut new_global_agg_desc = agg_step.aggregates.clone();
                for agg_desc in &mut new_global_agg_desc {
                    agg_desc.argument_names = self.mapper.map_names(&agg_desc.argument_names);
                    if class_of_agg_func(&agg_desc.function.name) == AggFuncClass::NeedsMerge {
                        let mut argument_types = Vec::with_capacity(agg_desc.argument_names.len());
                        for argument_name in &agg_desc.argument_names {
                            argument_types.push(
                                child_types
                                    .get(argument_name)
                                    .ok_or_else(|| {
                                        format!(
                                            "merge argument '{}' missing from child stream",
                                            argument_name
                                        )
                                    })?
                                    .clone(),
                            );
                        }
                        agg_desc.function = self.ctx.resolver.resolve(
                            &merge_name(&agg_desc.function.name),
                            &argument_types,
                            &agg_desc.parameters,
                        )?;
                    }
                }

                debug!(
                    "create global agg={}, keys={}",
                    format_aggregates(&new_global_agg_desc),
                    agg_step.keys.join(",")
                );

                let mut new_step = agg_step.clone();
                new_step.aggregates = new_global_agg_desc;
                self.arena
                    .replace(current, PlanStep::Aggregating(new_step), vec![child])?;
                Ok(current)
            }
            PlanStep::Projection(projection_step) => {
                if self.has_visit_join && !self.push_through_final_projection {
                    return Ok(current);
                }
                if !self.arena.node_ok(node.children[0])?.step.is_join() {
                    return Err("projection must be followed by join".to_string());
                }

                if self.push_projection {
                    self.proj = Some(current);
                }

                let child = self.update_until_bottom_join(node.children[0])?;

                if self.push_through_final_projection {
                    let child_types = self.arena.node_ok(child)?.stream.name_to_type();

                    let mut new_assignments = Assignments::default();
                    let mut new_name_to_type = projection_step.name_to_type.clone();
                    for (name, expr) in projection_step.assignments.iter() {
                        // A renamed input is aggregated away below; the
                        // intermediate takes its slot as a pass-through.
                        if let Some(new_name) = self.mapper.get(name) {
                            if child_types.contains_key(new_name) {
                                new_name_to_type.remove(name);
                                continue;
                            }
                        }
                        new_assignments.insert(name.clone(), self.mapper.map_expr(expr));
                    }
                    for (_, new_name) in self.mapper.entries() {
                        if child_types.contains_key(new_name) && !new_assignments.contains(new_name)
                        {
                            new_assignments
                                .insert(new_name.clone(), ScalarExpr::column(new_name.clone()));
                            new_name_to_type
                                .insert(new_name.clone(), child_types[new_name].clone());
                        }
                    }

                    let mut new_projection_step = projection_step.clone();
                    new_projection_step.assignments = new_assignments;
                    new_projection_step.name_to_type = new_name_to_type;
                    return self
                        .arena
                        .add(PlanStep::Projection(new_projection_step), vec![child]);
                }

                if self.push_projection {
                    return Ok(child);
                }

                let mut new_assignments = Assignments::default();
                let mut new_name_to_type = HashMap::new();
                for (name, expr) in projection_step.assignments.iter() {
                    new_assignments.insert(self.mapper.map_name(name), self.mapper.map_expr(expr));
                }
                for (name, data_type) in &projection_step.name_to_type {
                    new_name_to_type.insert(self.mapper.map_name(name), data_type.clone());
                }

                let mut new_projection_step = projection_step.clone();
                new_projection_step.assignments = new_assignments;
                new_projection_step.name_to_type = new_name_to_type;
                self.arena
                    .add(PlanStep::Projection(new_projection_step), vec![child])
            }
            PlanStep::Join(join_step) => {
                self.has_visit_join = true;

                let mut left_child = node.children[0];
                let mut right_child = node.children[1];
                if current == self.bottom_join_id {
                    let chosen = node.children[self.bottom_join_child_index];
                    let node_below_local_agg = if self.push_projection {
                        let proj_id = self
                            .proj
                            .ok_or_else(|| "push projection without projection node".to_string())?;
                        let PlanStep::Projection(proj_step) =
                            self.arena.node_ok(proj_id)?.step.clone()
                        else {
                            return Err("projection node lost its step".to_string());
                        };
                        let child_types = self.arena.node_ok(chosen)?.stream.name_to_type();

                        let mut new_assignments = Assignments::default();
                        let mut new_name_to_type = HashMap::new();
                        for (name, expr) in proj_step.assignments.iter() {
                            if is_identity(name, expr) && !child_types.contains_key(name) {
                                continue;
                            }
                            new_assignments.insert(name.clone(), expr.clone());
                            new_name_to_type.insert(
                                name.clone(),
                                proj_step
                                    .name_to_type
                                    .get(name)
                                    .ok_or_else(|| {
                                        format!("projection output '{}' has no type", name)
                                    })?
                                    .clone(),
                            );
                        }
                        for (name, data_type) in
                            self.arena.node_ok(chosen)?.stream.name_to_type()
                        {
                            if !new_assignments.contains(&name) {
                                new_assignments.insert(name.clone(), ScalarExpr::column(&name));
                                new_name_to_type.insert(name, data_type);
                            }
                        }

                        let mut new_proj_step = proj_step.clone();
                        new_proj_step.assignments = new_assignments;
                        new_proj_step.name_to_type = new_name_to_type;
                        self.arena
                            .add(PlanStep::Projection(new_proj_step), vec![chosen])?
                    } else {
                        chosen
                    };

                    let below_types = self
                        .arena
                        .node_ok(node_below_local_agg)?
                        .stream
                        .name_to_type();
                    let mut new_s1 = self.s1.to_vec();
                    for agg_desc in &mut new_s1 {
                        agg_desc.output_column_name =
                            self.mapper.map_name(&agg_desc.output_column_name);
                        if class_of_agg_func(&agg_desc.function.name) == AggFuncClass::NeedsMerge {
                            let mut argument_types =
                                Vec::with_capacity(agg_desc.argument_names.len());
                            for argument_name in &agg_desc.argument_names {
                                argument_types.push(
                                    below_types
                                        .get(argument_name)
                                        .ok_or_else(|| {
                                            format!(
                                                "state argument '{}' missing from child stream",
                                                argument_name
                                            )
                                        })?
                                        .clone(),
                                );
                            }
                            agg_desc.function = self.ctx.resolver.resolve(
                                &state_name(&agg_desc.function.name),
                                &argument_types,
                                &agg_desc.parameters,
                            )?;
                        }
                    }

                    let local_agg_step = create_local_aggregate(&new_s1, self.g1);
                    let local_agg = self.arena.add(
                        PlanStep::Aggregating(local_agg_step),
                        vec![node_below_local_agg],
                    )?;

                    if self.bottom_join_child_index == 0 {
                        left_child = local_agg;
                    } else {
                        right_child = local_agg;
                    }
                } else {
                    left_child = self.update_until_bottom_join(node.children[0])?;
                    right_child = self.update_until_bottom_join(node.children[1])?;
                }

                let mut new_join_step = join_step.clone();
                new_join_step.left_keys = self.mapper.map_names(&new_join_step.left_keys);
                new_join_step.right_keys = self.mapper.map_names(&new_join_step.right_keys);
                new_join_step.filter = new_join_step
                    .filter
                    .as_ref()
                    .map(|f| self.mapper.map_expr(f));

                self.arena.replace(
                    current,
                    PlanStep::Join(new_join_step),
                    vec![left_child, right_child],
                )?;
                Ok(current)
            }
            PlanStep::Source(_) => Ok(current),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn do_insert_aggregation(
    arena: &mut PlanArena,
    aggregation: PlanNodeId,
    s1: &[AggregateDescription],
    g1: &[String],
    push_projection: bool,
    bottom_join_id: PlanNodeId,
    bottom_join_child_index: usize,
    push_through_final_projection: bool,
    ctx: &RuleContext<'_>,
) -> Result<PlanNodeId, String> {
    let mut global_argument_name_to_local = HashMap::new();
    for aggregator in s1 {
        for argument_name in &aggregator.argument_names {
            if !global_argument_name_to_local.contains_key(argument_name)
                && !g1.contains(argument_name)
            {
                let new_argument_name = ctx
                    .symbols
                    .new_symbol(&format!("inter#{}", argument_name));
                global_argument_name_to_local
                    .insert(argument_name.clone(), new_argument_name.clone());
                global_argument_name_to_local
                    .insert(aggregator.output_column_name.clone(), new_argument_name);
            }
        }
    }

    let mut rewriter = PlanRewriter {
        arena,
        ctx,
        s1,
        g1,
        push_projection,
        bottom_join_id,
        bottom_join_child_index,
        push_through_final_projection,
        mapper: SymbolMapper::simple(global_argument_name_to_local),
        has_visit_global_agg: false,
        has_visit_join: false,
        proj: None,
    };
    rewriter.update_until_bottom_join(aggregation)
}

impl EagerAggregation {
    /// Apply the rule to the subtree rooted at `aggregation`.
    ///
    /// `Ok(Some(root))` means the arena was rewritten in place (ids of the
    /// top aggregate and every join are preserved); `Ok(None)` means the
    /// plan is unchanged.
    pub fn transform(
        &self,
        arena: &mut PlanArena,
        aggregation: PlanNodeId,
        ctx: &RuleContext<'_>,
    ) -> Result<Option<PlanNodeId>, String> {
        let agg_node = arena.node_ok(aggregation)?;
        let PlanStep::Aggregating(agg_step) = agg_node.step.clone() else {
            return Ok(None);
        };
        if !agg_step.is_normal() || agg_step.keys.is_empty() {
            return Ok(None);
        }

        let mut projection = None;
        let mut node = agg_node;
        if let Some(&child) = node.children.first() {
            if arena.node_ok(child)?.step.is_projection() {
                projection = Some(child);
                node = arena.node_ok(child)?;
            }
        }
        let Some(&join) = node.children.first() else {
            return Ok(None);
        };
        if !arena.node_ok(join)?.step.is_join() {
            return Ok(None);
        }
        let parent_of_first_join = node.id;

        let join_node = arena.node_ok(join)?;
        let names_from_left = arena.node_ok(join_node.children[0])?.stream.name_set();
        let names_from_right = arena.node_ok(join_node.children[1])?.stream.name_set();

        let agg_step_keys_set: HashSet<String> = agg_step.keys.iter().cloned().collect();

        let Some(mut decomposition) = decompose_agg_join(
            &agg_step.aggregates,
            &agg_step_keys_set,
            &names_from_left,
            &names_from_right,
        ) else {
            return Ok(None);
        };

        let mut require_output_names_from_local_agg: HashSet<String> =
            agg_step.keys.iter().cloned().collect();
        for agg_desc in &agg_step.aggregates {
            require_output_names_from_local_agg.extend(agg_desc.argument_names.iter().cloned());
        }

        let mut projection_decomposition = ProjectionDecomposition::default();
        if let Some(projection_id) = projection {
            let PlanStep::Projection(projection_step) = arena.node_ok(projection_id)?.step.clone()
            else {
                return Ok(None);
            };
            let Some(decomposed) = decompose_projection(
                &projection_step,
                &decomposition.composed,
                &agg_step_keys_set,
                &names_from_left,
                &names_from_right,
                &mut decomposition.s1,
                &mut decomposition.s2,
                ctx.symbols,
            ) else {
                return Ok(None);
            };
            projection_decomposition = decomposed;

            if projection_decomposition.projection_require_symbols.is_empty() {
                for (_, expr) in projection_step.assignments.iter() {
                    require_output_names_from_local_agg.extend(expr.collect_symbols());
                }
            }
        }

        let target_map = if !projection_decomposition.rename_from_left.is_empty() {
            determine_bottom_join(
                arena,
                parent_of_first_join,
                projection,
                decomposition.s1.clone(),
                decomposition.g1.clone(),
                &projection_decomposition.projection_require_symbols,
                &projection_decomposition.projection_gene_symbols,
                &require_output_names_from_local_agg,
                &projection_decomposition.rename_from_left,
                ctx.settings,
            )?
        } else if !projection_decomposition.rename_from_right.is_empty() {
            determine_bottom_join(
                arena,
                parent_of_first_join,
                projection,
                decomposition.s2.clone(),
                decomposition.g2.clone(),
                &projection_decomposition.projection_require_symbols,
                &projection_decomposition.projection_gene_symbols,
                &require_output_names_from_local_agg,
                &projection_decomposition.rename_from_right,
                ctx.settings,
            )?
        } else {
            let mut aggregates = agg_step.aggregates.clone();
            aggregates.retain(|aggregate| {
                !aggregate
                    .argument_names
                    .iter()
                    .any(|name| agg_step_keys_set.contains(name))
            });
            determine_bottom_join(
                arena,
                parent_of_first_join,
                projection,
                aggregates,
                agg_step.keys.clone(),
                &projection_decomposition.projection_require_symbols,
                &projection_decomposition.projection_gene_symbols,
                &require_output_names_from_local_agg,
                &HashMap::new(),
                ctx.settings,
            )?
        };

        let mut changed = false;
        for (target_id, target) in &target_map {
            if !can_agg_push_down(target, arena, ctx)? {
                continue;
            }
            do_insert_aggregation(
                arena,
                aggregation,
                &target.aggregates,
                &target.keys,
                !projection_decomposition.projection_require_symbols.is_empty(),
                *target_id,
                target.bottom_join_child_index,
                target.push_through_final_projection,
                ctx,
            )?;
            changed = true;
        }

        Ok(changed.then_some(aggregation))
    }
}

#[cfg(test)]
mod tests {
    use super::{decompose_agg_join, update_agg_s0_g0};
    use crate::plan::step::{AggregateDescription, AggregateFunction};
    use arrow::datatypes::DataType;
    use std::collections::HashSet;

    fn agg(name: &str, arg: &str, output: &str) -> AggregateDescription {
        AggregateDescription {
            function: AggregateFunction {
                name: name.to_string(),
                result_type: DataType::Int64,
            },
            parameters: vec![],
            argument_names: vec![arg.to_string()],
            output_column_name: output.to_string(),
        }
    }

    fn names(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_function_aborts_decomposition() {
        let result = decompose_agg_join(
            &[agg("median", "x", "m")],
            &names(&["a"]),
            &names(&["a", "x"]),
            &names(&["b"]),
        );
        assert!(result.is_none());
    }

    #[test]
    fn group_key_on_neither_side_aborts_decomposition() {
        let result = decompose_agg_join(
            &[agg("sum", "x", "s")],
            &names(&["ghost"]),
            &names(&["a", "x"]),
            &names(&["b"]),
        );
        assert!(result.is_none());
    }

    #[test]
    fn aggregates_split_by_argument_side() {
        let decomposition = decompose_agg_join(
            &[agg("sum", "x", "s"), agg("min", "y", "m")],
            &names(&["a", "b"]),
            &names(&["a", "x"]),
            &names(&["b", "y"]),
        )
        .expect("decompose");
        assert_eq!(decomposition.s1.len(), 1);
        assert_eq!(decomposition.s1[0].argument_names, ["x"]);
        assert_eq!(decomposition.s2.len(), 1);
        assert_eq!(decomposition.s2[0].argument_names, ["y"]);
        assert!(decomposition.composed.is_empty());
        assert_eq!(decomposition.g1, ["a"]);
        assert_eq!(decomposition.g2, ["b"]);
    }

    #[test]
    fn aggregate_over_group_key_is_not_pushed() {
        let decomposition = decompose_agg_join(
            &[agg("sum", "a", "s")],
            &names(&["a"]),
            &names(&["a", "x"]),
            &names(&["b"]),
        )
        .expect("decompose");
        assert!(decomposition.s1.is_empty());
        assert!(decomposition.composed.is_empty());
    }

    #[test]
    fn side_step_prunes_aggregates_that_leave_the_side() {
        let s0 = vec![agg("sum", "x", "s")];
        let g0 = vec!["a".to_string()];
        assert!(update_agg_s0_g0(names(&["a", "x"]), &HashSet::new(), &s0, &g0).is_some());
        assert!(update_agg_s0_g0(names(&["a"]), &HashSet::new(), &s0, &g0).is_none());
    }
}
