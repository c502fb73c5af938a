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
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::plan::expr::ScalarExpr;

/// True when every name in `names` is a member of `set`.
pub fn contains_all<'a>(
    set: &HashSet<String>,
    names: impl IntoIterator<Item = &'a String>,
) -> bool {
    names.into_iter().all(|name| set.contains(name))
}

/// Allocator of plan-unique symbol names.
///
/// Shared by concurrent rewrites of disjoint subtrees; callers go through the
/// internal lock and never observe a name twice.
pub struct SymbolAllocator {
    used: Mutex<HashSet<String>>,
}

impl SymbolAllocator {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Seed the allocator with every name already present in `names`.
    pub fn with_reserved(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            used: Mutex::new(names.into_iter().collect()),
        }
    }

    pub fn reserve(&self, name: &str) {
        self.used.lock().expect("symbol allocator lock").insert(name.to_string());
    }

    /// Return `base` if still free, otherwise `base_<n>` for the smallest
    /// free `n`. The returned name is reserved.
    pub fn new_symbol(&self, base: &str) -> String {
        let mut used = self.used.lock().expect("symbol allocator lock");
        if used.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{}_{}", base, n);
            if used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

impl Default for SymbolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain `old name -> new name` mapping applied over plan structures.
///
/// Names without an entry map to themselves; expressions are rebuilt, never
/// mutated in place.
#[derive(Clone, Debug, Default)]
pub struct SymbolMapper {
    mapping: HashMap<String, String>,
}

impl SymbolMapper {
    pub fn simple(mapping: HashMap<String, String>) -> Self {
        Self { mapping }
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mapping.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.mapping.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.mapping.iter()
    }

    pub fn map_name(&self, name: &str) -> String {
        self.mapping
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn map_names(&self, names: &[String]) -> Vec<String> {
        names.iter().map(|n| self.map_name(n)).collect()
    }

    pub fn map_expr(&self, expr: &ScalarExpr) -> ScalarExpr {
        match expr {
            ScalarExpr::Column(name) => ScalarExpr::Column(self.map_name(name)),
            ScalarExpr::Literal { .. } => expr.clone(),
            ScalarExpr::Function { name, args } => ScalarExpr::Function {
                name: name.clone(),
                args: args.iter().map(|a| self.map_expr(a)).collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SymbolAllocator, SymbolMapper, contains_all};
    use crate::plan::expr::ScalarExpr;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn contains_all_on_empty_names_is_true() {
        let set: HashSet<String> = ["a".to_string()].into_iter().collect();
        let empty: Vec<String> = vec![];
        assert!(contains_all(&set, &empty));
        assert!(contains_all(&set, &["a".to_string()]));
        assert!(!contains_all(&set, &["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn allocator_never_reuses_a_name() {
        let allocator = SymbolAllocator::with_reserved(["inter#x".to_string()]);
        let first = allocator.new_symbol("inter#x");
        let second = allocator.new_symbol("inter#x");
        assert_ne!(first, "inter#x");
        assert_ne!(second, first);
        assert!(first.starts_with("inter#x"));
    }

    #[test]
    fn mapper_rewrites_columns_inside_calls() {
        let mapper = SymbolMapper::simple(HashMap::from([(
            "x".to_string(),
            "inter#x".to_string(),
        )]));
        let expr = ScalarExpr::call(
            "plus",
            vec![ScalarExpr::column("x"), ScalarExpr::column("y")],
        );
        let mapped = mapper.map_expr(&expr);
        assert_eq!(
            mapped,
            ScalarExpr::call(
                "plus",
                vec![ScalarExpr::column("inter#x"), ScalarExpr::column("y")],
            )
        );
    }
}
