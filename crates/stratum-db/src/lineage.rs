//! Lineage graph walks.
//!
//! `trace` is the audit/debugging primitive for the whole system: given
//! any element it returns every ancestor (what it was derived from) and
//! descendant (what was derived from it). The walks terminate because the
//! lineage graph is a DAG with raw units as roots and documents as sinks;
//! the `UNION` (not `UNION ALL`) in the CTEs also guards against cycles
//! introduced by corrupted data.

use sqlx::{PgPool, Row};

use stratum_core::{Error, Result};

/// One hop in a lineage walk.
#[derive(Debug, Clone)]
pub struct TraceHop {
    pub depth: i32,
    pub child_id: String,
    pub parent_ref: String,
}

/// Full ancestor/descendant closure of one element.
#[derive(Debug, Clone, Default)]
pub struct LineageTrace {
    pub element_id: String,
    /// Edges walked upward, shallowest first.
    pub ancestors: Vec<TraceHop>,
    /// Edges walked downward, shallowest first.
    pub descendants: Vec<TraceHop>,
}

impl LineageTrace {
    /// Raw-unit refs (`s_*`/`x_*`) reachable from the element.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = self
            .ancestors
            .iter()
            .filter(|hop| stratum_core::ids::is_raw_ref(&hop.parent_ref))
            .map(|hop| hop.parent_ref.as_str())
            .collect();
        roots.sort_unstable();
        roots.dedup();
        roots
    }
}

impl std::fmt::Display for LineageTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "lineage of {}", self.element_id)?;
        writeln!(f, "  ancestors ({}):", self.ancestors.len())?;
        for hop in &self.ancestors {
            writeln!(
                f,
                "    {:indent$}{} <- {}",
                "",
                hop.child_id,
                hop.parent_ref,
                indent = (hop.depth as usize - 1) * 2
            )?;
        }
        writeln!(f, "  descendants ({}):", self.descendants.len())?;
        for hop in &self.descendants {
            writeln!(
                f,
                "    {:indent$}{} -> {}",
                "",
                hop.parent_ref,
                hop.child_id,
                indent = (hop.depth as usize - 1) * 2
            )?;
        }
        Ok(())
    }
}

/// Walk the lineage DAG in both directions from `element_id`.
pub async fn trace(pool: &PgPool, element_id: &str) -> Result<LineageTrace> {
    let ancestor_rows = sqlx::query(
        "WITH RECURSIVE anc AS (
             SELECT child_id, parent_ref, 1 AS depth
             FROM lineage_edge WHERE child_id = $1
             UNION
             SELECT le.child_id, le.parent_ref, anc.depth + 1
             FROM lineage_edge le
             JOIN anc ON le.child_id = anc.parent_ref
         )
         SELECT child_id, parent_ref, depth FROM anc
         ORDER BY depth, parent_ref",
    )
    .bind(element_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)?;

    let descendant_rows = sqlx::query(
        "WITH RECURSIVE descs AS (
             SELECT child_id, parent_ref, 1 AS depth
             FROM lineage_edge WHERE parent_ref = $1
             UNION
             SELECT le.child_id, le.parent_ref, descs.depth + 1
             FROM lineage_edge le
             JOIN descs ON le.parent_ref = descs.child_id
         )
         SELECT child_id, parent_ref, depth FROM descs
         ORDER BY depth, child_id",
    )
    .bind(element_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)?;

    let to_hop = |row: sqlx::postgres::PgRow| TraceHop {
        depth: row.get("depth"),
        child_id: row.get("child_id"),
        parent_ref: row.get("parent_ref"),
    };

    Ok(LineageTrace {
        element_id: element_id.to_string(),
        ancestors: ancestor_rows.into_iter().map(to_hop).collect(),
        descendants: descendant_rows.into_iter().map(to_hop).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(depth: i32, child: &str, parent: &str) -> TraceHop {
        TraceHop {
            depth,
            child_id: child.to_string(),
            parent_ref: parent.to_string(),
        }
    }

    #[test]
    fn test_roots_filters_raw_refs() {
        let trace = LineageTrace {
            element_id: "d_doc".to_string(),
            ancestors: vec![
                hop(1, "d_doc", "i_ins"),
                hop(2, "i_ins", "t_th"),
                hop(3, "t_th", "f_fact"),
                hop(4, "f_fact", "s_chat_sync_abc"),
                hop(4, "f_fact", "x_0011aabb"),
            ],
            descendants: vec![],
        };
        assert_eq!(trace.roots(), vec!["s_chat_sync_abc", "x_0011aabb"]);
    }

    #[test]
    fn test_roots_dedupes() {
        let trace = LineageTrace {
            element_id: "i_x".to_string(),
            ancestors: vec![
                hop(2, "f_a", "s_chat_sync_abc"),
                hop(2, "f_b", "s_chat_sync_abc"),
            ],
            descendants: vec![],
        };
        assert_eq!(trace.roots(), vec!["s_chat_sync_abc"]);
    }

    #[test]
    fn test_display_includes_counts() {
        let trace = LineageTrace {
            element_id: "t_th".to_string(),
            ancestors: vec![hop(1, "t_th", "f_fact")],
            descendants: vec![hop(1, "i_ins", "t_th")],
        };
        let rendered = trace.to_string();
        assert!(rendered.contains("lineage of t_th"));
        assert!(rendered.contains("ancestors (1)"));
        assert!(rendered.contains("descendants (1)"));
    }
}
