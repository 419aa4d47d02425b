//! Insertion order from declared table dependencies.
//!
//! Builds a graph with one node per table and an edge from each child to every
//! parent it references, then orders it with Kahn's algorithm. Ties are
//! broken by input position, so the same configuration always produces the
//! same order.

use crate::error::LoadError;
use crate::model::TableConfig;
use std::collections::{BTreeSet, HashMap};

/// Child → parent graph over a set of table configurations.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `parents[i]`: distinct input positions table `i` depends on
    parents: Vec<Vec<usize>>,
    /// `children[i]`: input positions of tables that depend on table `i`
    children: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph. Duplicate table names and unknown parents are configuration errors.
    pub fn build(tables: &[TableConfig]) -> Result<Self, LoadError> {
        let mut positions = HashMap::with_capacity(tables.len());
        for (position, table) in tables.iter().enumerate() {
            if positions.insert(table.name.as_str(), position).is_some() {
                return Err(LoadError::InvalidConfig(format!(
                    "table {} is configured more than once",
                    table.name
                )));
            }
        }

        let mut parents = vec![Vec::new(); tables.len()];
        let mut children = vec![Vec::new(); tables.len()];

        for (child, table) in tables.iter().enumerate() {
            for dependency in &table.dependencies {
                let parent = *positions.get(dependency.parent_table.as_str()).ok_or_else(|| {
                    LoadError::InvalidConfig(format!(
                        "table {} depends on unknown table {}",
                        table.name, dependency.parent_table
                    ))
                })?;

                // Several columns may point at the same parent; keep one edge.
                if !parents[child].contains(&parent) {
                    parents[child].push(parent);
                    children[parent].push(child);
                }
            }
        }

        Ok(Self {
            names: tables.iter().map(|t| t.name.clone()).collect(),
            parents,
            children,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn parents_of(&self, position: usize) -> &[usize] {
        &self.parents[position]
    }

    /// Input positions in insertion order (parents before children).
    ///
    /// ## Algorithm
    ///
    /// Kahn's algorithm with the ready set ordered by input position. Every
    /// table whose parents have all been emitted is ready; the lowest ready
    /// position is emitted next. If tables remain once nothing is ready,
    /// they are blocked by a cycle and [`LoadError::DependencyCycle`] is
    /// returned naming the tables on the cycle.
    ///
    /// ## Example
    ///
    /// ```text
    /// input:  order_items → orders, orders → users, users
    /// output: users, orders, order_items
    /// ```
    pub fn topological_order(&self) -> Result<Vec<usize>, LoadError> {
        let mut unresolved: Vec<usize> = self.parents.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| unresolved[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &child in &self.children[next] {
                unresolved[child] -= 1;
                if unresolved[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() == self.len() {
            return Ok(order);
        }

        let tables = self
            .cycle_members(&unresolved)
            .into_iter()
            .map(|position| self.names[position].clone())
            .collect();
        Err(LoadError::DependencyCycle { tables })
    }

    /// Reduce the unordered remainder to tables that actually sit on a cycle.
    ///
    /// Tables that only hang below a cycle still have a parent left after
    /// Kahn's pass. Peeling remaining tables that no remaining table depends
    /// on (repeatedly) leaves just the cycles.
    fn cycle_members(&self, unresolved: &[usize]) -> Vec<usize> {
        let mut remaining: Vec<bool> = unresolved.iter().map(|&count| count > 0).collect();
        let mut dependents: Vec<usize> = (0..self.len())
            .map(|i| {
                if remaining[i] {
                    self.children[i].iter().filter(|&&c| remaining[c]).count()
                } else {
                    0
                }
            })
            .collect();

        let mut leaves: Vec<usize> = (0..self.len())
            .filter(|&i| remaining[i] && dependents[i] == 0)
            .collect();
        while let Some(leaf) = leaves.pop() {
            remaining[leaf] = false;
            for &parent in &self.parents[leaf] {
                if remaining[parent] {
                    dependents[parent] -= 1;
                    if dependents[parent] == 0 {
                        leaves.push(parent);
                    }
                }
            }
        }

        (0..self.len()).filter(|&i| remaining[i]).collect()
    }
}

/// Input positions of `tables` in insertion order.
pub fn resolve_order(tables: &[TableConfig]) -> Result<Vec<usize>, LoadError> {
    DependencyGraph::build(tables)?.topological_order()
}

/// Reorder `tables` so that every parent precedes its dependents.
pub fn resolve(tables: Vec<TableConfig>) -> Result<Vec<TableConfig>, LoadError> {
    let order = resolve_order(&tables)?;
    let mut slots: Vec<Option<TableConfig>> = tables.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, parents: &[&str]) -> TableConfig {
        let mut columns = vec!["code".to_string()];
        columns.extend(parents.iter().map(|p| format!("{}_code", p)));
        let mut config = TableConfig::new(name, columns);
        for parent in parents {
            config = config.depends_on(format!("{}_code", parent), *parent);
        }
        config
    }

    fn names(tables: &[TableConfig]) -> Vec<&str> {
        tables.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_parents_come_first() {
        let tables = vec![
            table("order_items", &["orders"]),
            table("orders", &["users"]),
            table("users", &[]),
        ];

        let ordered = resolve(tables).unwrap();
        assert_eq!(names(&ordered), vec!["users", "orders", "order_items"]);
    }

    #[test]
    fn test_independent_tables_keep_input_order() {
        let tables = vec![
            table("c", &[]),
            table("a", &[]),
            table("child", &["a", "c"]),
            table("b", &[]),
        ];

        let ordered = resolve(tables).unwrap();
        assert_eq!(names(&ordered), vec!["c", "a", "child", "b"]);
    }

    #[test]
    fn test_diamond() {
        let tables = vec![
            table("leaf", &["left", "right"]),
            table("right", &["root"]),
            table("left", &["root"]),
            table("root", &[]),
        ];

        let order = resolve_order(&tables).unwrap();
        let position = |name: &str| {
            order
                .iter()
                .position(|&i| tables[i].name == name)
                .unwrap()
        };
        assert!(position("root") < position("left"));
        assert!(position("root") < position("right"));
        assert!(position("left") < position("leaf"));
        assert!(position("right") < position("leaf"));
    }

    #[test]
    fn test_mutual_dependency_is_a_cycle() {
        let tables = vec![table("a", &["b"]), table("b", &["a"])];

        match resolve_order(&tables) {
            Err(LoadError::DependencyCycle { tables }) => assert_eq!(tables, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_report_excludes_downstream_tables() {
        let tables = vec![
            table("root", &[]),
            table("x", &["root", "z"]),
            table("y", &["x"]),
            table("z", &["y"]),
            table("downstream", &["z"]),
        ];

        match resolve_order(&tables) {
            Err(LoadError::DependencyCycle { tables }) => {
                assert_eq!(tables, vec!["x", "y", "z"])
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let tables = vec![table("employees", &["employees"])];
        assert!(matches!(
            resolve_order(&tables),
            Err(LoadError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_unknown_parent() {
        let tables = vec![table("orders", &["users"])];
        assert!(matches!(resolve_order(&tables), Err(LoadError::InvalidConfig(_))));
    }

    #[test]
    fn test_duplicate_table_name() {
        let tables = vec![table("users", &[]), table("users", &[])];
        assert!(matches!(resolve_order(&tables), Err(LoadError::InvalidConfig(_))));
    }

    #[test]
    fn test_repeated_parent_reference_counts_once() {
        let tables = vec![
            TableConfig::new("transfers", ["code", "from_account", "to_account"])
                .depends_on("from_account", "accounts")
                .depends_on("to_account", "accounts"),
            table("accounts", &[]),
        ];

        let ordered = resolve(tables).unwrap();
        assert_eq!(names(&ordered), vec!["accounts", "transfers"]);
    }
}
