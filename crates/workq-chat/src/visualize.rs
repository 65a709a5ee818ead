//! Chart-ready data derived from retrieved work items.

use std::collections::{BTreeMap, HashMap, HashSet};

use workq_core::types::{BreakdownPoint, HierarchyNode, Visualization, WorkItem};

const UNASSIGNED: &str = "Unassigned";

/// Build every visualization that has something to show.
///
/// Breakdowns with fewer than two distinct labels are omitted, as is the
/// hierarchy when no item names a parent that is also in the result set.
pub fn build_visualizations(items: &[WorkItem]) -> Vec<Visualization> {
    if items.is_empty() {
        return vec![];
    }

    let dimensions: [(&str, &str, fn(&WorkItem) -> String); 3] = [
        ("Items by state", "state", by_state),
        ("Items by type", "type", by_type),
        ("Items by assignee", "assignee", by_assignee),
    ];

    let mut out = Vec::new();
    for (title, dimension, label) in dimensions {
        let points = breakdown(items, label);
        if points.len() > 1 {
            out.push(Visualization::Breakdown {
                title: title.to_string(),
                dimension: dimension.to_string(),
                points,
            });
        }
    }

    let roots = hierarchy(items);
    if roots.iter().any(|r| !r.children.is_empty()) {
        out.push(Visualization::Hierarchy {
            title: "Parent and child items".to_string(),
            roots,
        });
    }
    out
}

fn by_state(item: &WorkItem) -> String {
    item.state.clone()
}

fn by_type(item: &WorkItem) -> String {
    item.item_type.clone()
}

fn by_assignee(item: &WorkItem) -> String {
    item.assigned_to
        .clone()
        .unwrap_or_else(|| UNASSIGNED.to_string())
}

/// Count items per label, largest first, ties alphabetical.
pub fn breakdown(items: &[WorkItem], label: impl Fn(&WorkItem) -> String) -> Vec<BreakdownPoint> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for item in items {
        *counts.entry(label(item)).or_default() += 1;
    }
    let mut points: Vec<BreakdownPoint> = counts
        .into_iter()
        .map(|(label, value)| BreakdownPoint { label, value })
        .collect();
    points.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.label.cmp(&b.label)));
    points
}

/// Parent/child forest from explicit `parent_id` links only.
///
/// An item whose parent is not in `items` becomes a root. Input order is
/// preserved among siblings.
pub fn hierarchy(items: &[WorkItem]) -> Vec<HierarchyNode> {
    let present: HashSet<u64> = items.iter().map(|i| i.id).collect();
    let mut children: HashMap<u64, Vec<&WorkItem>> = HashMap::new();
    let mut roots = Vec::new();

    for item in items {
        match item.parent_id {
            Some(parent) if parent != item.id && present.contains(&parent) => {
                children.entry(parent).or_default().push(item)
            }
            _ => roots.push(item),
        }
    }

    let mut visited = HashSet::new();
    roots
        .into_iter()
        .map(|root| build_node(root, &children, &mut visited))
        .collect()
}

fn build_node(
    item: &WorkItem,
    children: &HashMap<u64, Vec<&WorkItem>>,
    visited: &mut HashSet<u64>,
) -> HierarchyNode {
    visited.insert(item.id);
    let mut kids = Vec::new();
    for kid in children.get(&item.id).into_iter().flatten() {
        if !visited.contains(&kid.id) {
            kids.push(build_node(kid, children, visited));
        }
    }

    HierarchyNode {
        id: item.id,
        title: item.title.clone(),
        item_type: item.item_type.clone(),
        children: kids,
    }
}
