//! Staleness detection
//!
//! A project is stale when another project has seen more recent activity.
//! The most recently active project is offered as a suggestion; the user
//! decides whether to switch.

use crate::models::Project;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Staleness {
    pub is_stale: bool,
    pub suggested: Option<Project>,
}

/// Most recent activity first; projects never touched sort last.
/// Ties fall back to name, then id, so every client agrees.
fn by_recent_activity(a: &Project, b: &Project) -> Ordering {
    match (a.last_activity_at, b.last_activity_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.name.cmp(&b.name))
    .then_with(|| a.id.cmp(&b.id))
}

/// Compare the active project against every known project.
pub fn detect(projects: &[Project], active_id: Option<&str>) -> Staleness {
    let Some(active_id) = active_id else {
        return Staleness::default();
    };

    let Some(latest) = projects.iter().min_by(|a, b| by_recent_activity(a, b)) else {
        return Staleness::default();
    };

    if latest.id == active_id {
        return Staleness::default();
    }

    tracing::debug!(
        "Project {} is stale, {} has newer activity",
        active_id,
        latest.id
    );
    Staleness {
        is_stale: true,
        suggested: Some(latest.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn project(id: &str, name: &str, minute: Option<u32>) -> Project {
        Project {
            id: id.into(),
            name: name.into(),
            last_activity_at: minute.map(|m| Utc.with_ymd_and_hms(2024, 5, 10, 9, m, 0).unwrap()),
        }
    }

    #[test]
    fn test_newer_project_makes_active_stale() {
        let projects = vec![project("a", "Alpha", Some(1)), project("b", "Beta", Some(5))];

        let result = detect(&projects, Some("a"));
        assert!(result.is_stale);
        assert_eq!(result.suggested.map(|p| p.id), Some("b".to_string()));

        assert_eq!(detect(&projects, Some("b")), Staleness::default());
    }

    #[test]
    fn test_untouched_projects_sort_last() {
        let projects = vec![project("a", "Alpha", None), project("b", "Beta", Some(1))];
        let result = detect(&projects, Some("b"));
        assert!(!result.is_stale);
    }

    #[test]
    fn test_ties_break_on_name_then_id() {
        let projects = vec![
            project("z", "Same", Some(3)),
            project("y", "Same", Some(3)),
            project("x", "Other", Some(3)),
        ];

        let result = detect(&projects, Some("y"));
        assert_eq!(result.suggested.map(|p| p.id), Some("x".to_string()));

        let projects = vec![project("z", "Same", Some(3)), project("y", "Same", Some(3))];
        assert!(!detect(&projects, Some("y")).is_stale);
        assert!(detect(&projects, Some("z")).is_stale);
    }

    #[test]
    fn test_no_projects_or_no_active() {
        assert_eq!(detect(&[], Some("a")), Staleness::default());
        assert_eq!(
            detect(&[project("a", "Alpha", Some(1))], None),
            Staleness::default()
        );
    }
}
