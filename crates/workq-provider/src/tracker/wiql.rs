//! Search criteria to WIQL (work item query language) text.

use workq_core::types::{SearchCriteria, TimeFrame};

/// Fields requested for every work item.
pub const ITEM_FIELDS: [&str; 10] = [
    "System.Id",
    "System.Title",
    "System.State",
    "System.WorkItemType",
    "System.AssignedTo",
    "System.Tags",
    "Microsoft.VSTS.Common.Priority",
    "System.IterationPath",
    "System.Parent",
    "System.ChangedDate",
];

/// A sprint reference resolved from free text such as "last sprint".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SprintRef {
    Current,
    /// Relative to the current sprint: -1 is the previous one.
    Offset(i32),
    /// An iteration name or path.
    Named(String),
}

impl SprintRef {
    pub fn parse(raw: &str) -> Option<Self> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        let lower = text.to_lowercase();
        let sprint_ref = match lower.as_str() {
            "current" | "current sprint" | "this sprint" | "current iteration"
            | "this iteration" | "@currentiteration" => SprintRef::Current,
            "past" | "last sprint" | "previous sprint" | "last iteration"
            | "previous iteration" => SprintRef::Offset(-1),
            "future" | "next sprint" | "next iteration" | "upcoming sprint" => {
                SprintRef::Offset(1)
            }
            _ => SprintRef::Named(text.to_string()),
        };
        Some(sprint_ref)
    }

    /// The coarse time frame, when this reference is relative.
    pub fn time_frame(&self) -> Option<TimeFrame> {
        match self {
            SprintRef::Current => Some(TimeFrame::Current),
            SprintRef::Offset(n) if *n < 0 => Some(TimeFrame::Past),
            SprintRef::Offset(n) if *n > 0 => Some(TimeFrame::Future),
            SprintRef::Offset(_) => Some(TimeFrame::Current),
            SprintRef::Named(_) => None,
        }
    }
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn is_self_reference(assignee: &str) -> bool {
    matches!(
        assignee.trim().to_lowercase().as_str(),
        "me" | "@me" | "myself" | "mine"
    )
}

/// Build a flat work-item query for `criteria`, newest changes first.
///
/// `@project` and `@CurrentIteration` are resolved by the tracker from the
/// project and team in the request URL.
pub fn build_query(criteria: &SearchCriteria) -> String {
    let mut clauses = vec!["[System.TeamProject] = @project".to_string()];

    if let Some(state) = criteria.status.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push(format!("[System.State] = {}", quote(state.trim())));
    }
    if let Some(kind) = criteria.item_type.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push(format!("[System.WorkItemType] = {}", quote(kind.trim())));
    }
    if let Some(assignee) = criteria.assignee.as_deref().filter(|s| !s.trim().is_empty()) {
        if is_self_reference(assignee) {
            clauses.push("[System.AssignedTo] = @Me".to_string());
        } else if assignee.contains('@') {
            clauses.push(format!("[System.AssignedTo] = {}", quote(assignee.trim())));
        } else {
            clauses.push(format!(
                "[System.AssignedTo] CONTAINS {}",
                quote(assignee.trim())
            ));
        }
    }
    for tag in criteria.tags.iter().filter(|t| !t.trim().is_empty()) {
        clauses.push(format!("[System.Tags] CONTAINS {}", quote(tag.trim())));
    }
    if let Some(priority) = criteria.priority {
        clauses.push(format!("[Microsoft.VSTS.Common.Priority] = {}", priority));
    }
    if let Some(text) = criteria.free_text.as_deref().filter(|s| !s.trim().is_empty()) {
        let literal = quote(text.trim());
        clauses.push(format!(
            "([System.Title] CONTAINS {literal} OR [System.Description] CONTAINS {literal})"
        ));
    }
    if let Some(sprint) = criteria.timeframe.as_deref().and_then(SprintRef::parse) {
        clauses.push(match sprint {
            SprintRef::Current => "[System.IterationPath] = @CurrentIteration".to_string(),
            SprintRef::Offset(n) if n < 0 => {
                format!("[System.IterationPath] = @CurrentIteration - {}", -n)
            }
            SprintRef::Offset(n) => format!("[System.IterationPath] = @CurrentIteration + {}", n),
            SprintRef::Named(name) => format!("[System.IterationPath] UNDER {}", quote(&name)),
        });
    }

    format!(
        "SELECT [System.Id] FROM WorkItems WHERE {} ORDER BY [System.ChangedDate] DESC",
        clauses.join(" AND ")
    )
}
