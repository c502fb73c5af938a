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
use arrow::datatypes::DataType;

use crate::optimizer::agg_class::{AggFuncClass, class_of_agg_func};
use crate::plan::step::{AggregateFunction, AggregateFunctionResolver};

/// Resolver for the aggregate functions the rewriter knows how to split.
///
/// `<f>State` yields an opaque accumulator typed as `Binary`; `<f>Merge`
/// consumes it and yields the base function's final type. `count` and
/// `uniqExact` are the only mergeable bases, both finalizing to `UInt64`.
pub struct BuiltinAggregateResolver;

fn widened_sum_type(arg: &DataType) -> DataType {
    match arg {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => DataType::Int64,
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            DataType::UInt64
        }
        DataType::Float32 | DataType::Float64 => DataType::Float64,
        other => other.clone(),
    }
}

fn mergeable_final_type(base: &str) -> Option<DataType> {
    match base.to_lowercase().as_str() {
        "count" | "uniqexact" => Some(DataType::UInt64),
        _ => None,
    }
}

impl AggregateFunctionResolver for BuiltinAggregateResolver {
    fn resolve(
        &self,
        name: &str,
        arg_types: &[DataType],
        _params: &[String],
    ) -> Result<AggregateFunction, String> {
        if let Some(base) = name.strip_suffix("State") {
            if class_of_agg_func(base) == AggFuncClass::NeedsMerge {
                return Ok(AggregateFunction {
                    name: name.to_string(),
                    result_type: DataType::Binary,
                });
            }
            return Err(format!("aggregate function '{}' has no state form", name));
        }

        if let Some(base) = name.strip_suffix("Merge") {
            if let Some(result_type) = mergeable_final_type(base) {
                return Ok(AggregateFunction {
                    name: name.to_string(),
                    result_type,
                });
            }
            return Err(format!("aggregate function '{}' has no merge form", name));
        }

        let result_type = match name.to_lowercase().as_str() {
            "count" | "uniqexact" => DataType::UInt64,
            "sum" | "sumwithoverflow" => {
                let arg = arg_types
                    .first()
                    .ok_or_else(|| format!("aggregate '{}' requires an argument", name))?;
                widened_sum_type(arg)
            }
            "any" | "anylast" | "min" | "max" | "groupbitand" | "groupbitor" | "groupbitxor"
            | "summap" | "minmap" | "maxmap" | "grouparrayarray" | "grouparraylastarray"
            | "groupuniqarrayarray" | "summappedarrays" | "minmappedarrays"
            | "maxmappedarrays" => arg_types
                .first()
                .cloned()
                .ok_or_else(|| format!("aggregate '{}' requires an argument", name))?,
            _ => return Err(format!("unknown aggregate function '{}'", name)),
        };

        Ok(AggregateFunction {
            name: name.to_string(),
            result_type,
        })
    }
}
