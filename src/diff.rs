//! Change detection between the source and the persisted mirror.
//!
//! [`is_outdated`] is the sole authority on "what changed": a page is
//! reprocessed only when this predicate holds for its edit timestamps.
//! It must never fail a run — unparseable timestamps degrade to a
//! lexicographic string comparison, which is correct for well-formed
//! ISO 8601 values with a shared offset and safe for everything else.

use chrono::DateTime;

/// Returns `true` when the persisted copy of a page is stale.
///
/// - No persisted timestamp → the page has never been synced → `true`.
/// - No source timestamp but a persisted one → nothing newer to pull → `false`.
/// - Both present and parseable → strict instant comparison.
/// - Either unparseable → string comparison fallback.
pub fn is_outdated(source_edited: Option<&str>, persisted_edited: Option<&str>) -> bool {
    let Some(persisted) = persisted_edited else {
        return true;
    };
    let Some(source) = source_edited else {
        return false;
    };

    match (
        DateTime::parse_from_rfc3339(source),
        DateTime::parse_from_rfc3339(persisted),
    ) {
        (Ok(source_at), Ok(persisted_at)) => source_at > persisted_at,
        _ => source > persisted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_persisted_is_outdated() {
        assert!(is_outdated(Some("2024-01-01T00:00:00Z"), None));
        assert!(is_outdated(None, None));
    }

    #[test]
    fn test_missing_source_is_not_outdated() {
        assert!(!is_outdated(None, Some("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn test_strictly_newer_source_is_outdated() {
        assert!(is_outdated(
            Some("2024-06-02T00:00:00Z"),
            Some("2024-06-01T00:00:00Z")
        ));
    }

    #[test]
    fn test_equal_timestamps_are_not_outdated() {
        assert!(!is_outdated(
            Some("2024-06-01T00:00:00Z"),
            Some("2024-06-01T00:00:00Z")
        ));
    }

    #[test]
    fn test_older_source_is_not_outdated() {
        assert!(!is_outdated(
            Some("2024-05-31T23:59:59Z"),
            Some("2024-06-01T00:00:00Z")
        ));
    }

    #[test]
    fn test_offset_aware_comparison() {
        // 10:00+09:00 is 01:00Z, earlier than 02:00Z.
        assert!(!is_outdated(
            Some("2024-06-01T10:00:00+09:00"),
            Some("2024-06-01T02:00:00Z")
        ));
        assert!(is_outdated(
            Some("2024-06-01T12:00:00+09:00"),
            Some("2024-06-01T02:00:00Z")
        ));
    }

    #[test]
    fn test_unparseable_falls_back_to_string_comparison() {
        assert!(is_outdated(Some("b-not-a-date"), Some("a-not-a-date")));
        assert!(!is_outdated(Some("a-not-a-date"), Some("b-not-a-date")));
        // One side unparseable is enough to trigger the fallback.
        assert!(is_outdated(Some("9999"), Some("2024-06-01T00:00:00Z")));
    }
}
