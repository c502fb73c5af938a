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
use std::collections::BTreeSet;
use std::fmt;

use arrow::datatypes::DataType;

/// Scalar expression over named input columns.
///
/// The optimizer only inspects structure (column references, `multiIf` calls);
/// evaluation happens elsewhere.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarExpr {
    Column(String),
    Literal { value: String, data_type: DataType },
    Function { name: String, args: Vec<ScalarExpr> },
}

impl ScalarExpr {
    pub fn column(name: impl Into<String>) -> Self {
        ScalarExpr::Column(name.into())
    }

    pub fn literal(value: impl Into<String>, data_type: DataType) -> Self {
        ScalarExpr::Literal {
            value: value.into(),
            data_type,
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<ScalarExpr>) -> Self {
        ScalarExpr::Function {
            name: name.into(),
            args,
        }
    }

    pub fn as_column(&self) -> Option<&str> {
        match self {
            ScalarExpr::Column(name) => Some(name),
            _ => None,
        }
    }

    /// All column names referenced by this expression, in name order.
    pub fn collect_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols_into(&mut out);
        out
    }

    pub fn collect_symbols_into(&self, out: &mut BTreeSet<String>) {
        match self {
            ScalarExpr::Column(name) => {
                out.insert(name.clone());
            }
            ScalarExpr::Literal { .. } => {}
            ScalarExpr::Function { args, .. } => {
                for arg in args {
                    arg.collect_symbols_into(out);
                }
            }
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::Column(name) => f.write_str(name),
            ScalarExpr::Literal { value, .. } => write!(f, "'{}'", value),
            ScalarExpr::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// `name := name` pass-through assignment.
pub fn is_identity(name: &str, expr: &ScalarExpr) -> bool {
    matches!(expr, ScalarExpr::Column(column) if column == name)
}

#[cfg(test)]
mod tests {
    use super::{ScalarExpr, is_identity};
    use arrow::datatypes::DataType;

    #[test]
    fn collect_symbols_walks_nested_calls() {
        let expr = ScalarExpr::call(
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
        let symbols: Vec<String> = expr.collect_symbols().into_iter().collect();
        assert_eq!(symbols, ["tag", "v1", "v2"]);
    }

    #[test]
    fn identity_requires_matching_name() {
        assert!(is_identity("x", &ScalarExpr::column("x")));
        assert!(!is_identity("x", &ScalarExpr::column("y")));
        assert!(!is_identity(
            "x",
            &ScalarExpr::call("abs", vec![ScalarExpr::column("x")])
        ));
    }
}
