//! The match predicate applied to every enumerated item.

use chrono::{DateTime, Utc};

use crate::backend::ListDirTask;

/// Decides whether one listed item passes the task's filters.
///
/// `name` is the final path component; `mtime` is the item's own
/// modification time as reported by the backend (`None` when the backend
/// has none). The predicate is pure and total: a malformed glob never
/// matches.
pub fn is_match(task: &ListDirTask, name: &str, mtime: Option<DateTime<Utc>>, size: u64) -> bool {
    if !task.incl_empty && size == 0 {
        return false;
    }

    if !task.hidden && name.starts_with('.') {
        return false;
    }

    if let Some(since) = task.since {
        match mtime {
            Some(mtime) if mtime >= since => {}
            _ => return false,
        }
    }

    if size < task.min_size || (task.max_size > 0 && size > task.max_size) {
        return false;
    }

    if !task.source.filter.is_empty() {
        let glob = match globset::GlobBuilder::new(&task.source.filter)
            .literal_separator(true)
            .build()
        {
            Ok(glob) => glob,
            Err(_) => return false,
        };
        if !glob.compile_matcher().is_match(name) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task() -> ListDirTask {
        ListDirTask {
            incl_empty: true,
            hidden: true,
            ..Default::default()
        }
    }

    fn now() -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }

    #[test]
    fn test_empty_files_excluded_by_default() {
        let task = ListDirTask::default();
        assert!(!is_match(&task, "a.txt", now(), 0));
        assert!(is_match(&task, "a.txt", now(), 1));

        let task = ListDirTask {
            incl_empty: true,
            ..Default::default()
        };
        assert!(is_match(&task, "a.txt", now(), 0));
    }

    #[test]
    fn test_hidden_names_excluded_by_default() {
        let task = ListDirTask::default();
        assert!(!is_match(&task, ".hidden", now(), 10));

        let task = ListDirTask {
            hidden: true,
            ..Default::default()
        };
        assert!(is_match(&task, ".hidden", now(), 10));
    }

    #[test]
    fn test_since_bound() {
        let mut task = task();
        task.since = Some(Utc::now() - Duration::hours(1));
        assert!(is_match(&task, "a.txt", now(), 10));
        assert!(!is_match(
            &task,
            "a.txt",
            Some(Utc::now() - Duration::hours(2)),
            10
        ));
        // an item with no reported mtime cannot satisfy a bound
        assert!(!is_match(&task, "a.txt", None, 10));
    }

    #[test]
    fn test_since_is_inclusive() {
        let bound = Utc::now() - Duration::hours(1);
        let mut task = task();
        task.since = Some(bound);
        assert!(is_match(&task, "a.txt", Some(bound), 10));
    }

    #[test]
    fn test_size_bounds() {
        let mut task = task();
        task.min_size = 5;
        assert!(!is_match(&task, "a.txt", now(), 4));
        assert!(is_match(&task, "a.txt", now(), 5));

        task.max_size = 10;
        assert!(is_match(&task, "a.txt", now(), 10));
        assert!(!is_match(&task, "a.txt", now(), 11));

        // max_size == 0 means no upper bound
        task.max_size = 0;
        assert!(is_match(&task, "a.txt", now(), u64::MAX));
    }

    #[test]
    fn test_glob_filter() {
        let mut task = task();
        task.source.filter = "*.csv".to_string();
        assert!(is_match(&task, "a.csv", now(), 10));
        assert!(!is_match(&task, "a.txt", now(), 10));
    }

    #[test]
    fn test_malformed_glob_never_matches() {
        let mut task = task();
        task.source.filter = "[".to_string();
        assert!(!is_match(&task, "a.csv", now(), 10));
    }
}
