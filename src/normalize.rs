//! Content normalization applied before embedding and storage.
//!
//! Pure and deterministic: no I/O, no clock, no randomness.

/// Flattened content shorter than this is considered non-viable on its own
/// and is padded with the book title and note.
const MIN_VIABLE_CHARS: usize = 20;

/// Hard cap on stored content length, in characters.
const MAX_CONTENT_CHARS: usize = 12_000;

/// Shape flattened page text into the form that gets embedded and stored.
///
/// Trims surrounding whitespace; if the result is below the minimum viable
/// length, falls back to joining it with the book title and note (skipping
/// absent parts); finally truncates to [`MAX_CONTENT_CHARS`], preserving the
/// prefix on a character boundary.
pub fn normalize_content(content: &str, book_title: Option<&str>, note: &str) -> String {
    let mut normalized = content.trim().to_string();

    if normalized.chars().count() < MIN_VIABLE_CHARS {
        let parts: Vec<&str> = [normalized.as_str(), book_title.unwrap_or(""), note]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect();
        normalized = parts.join("\n").trim().to_string();
    }

    if normalized.chars().count() > MAX_CONTENT_CHARS {
        normalized = normalized.chars().take(MAX_CONTENT_CHARS).collect();
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content_uses_fallbacks() {
        assert_eq!(normalize_content("", Some("T"), "p.5"), "T\np.5");
    }

    #[test]
    fn test_short_content_is_padded() {
        assert_eq!(
            normalize_content("  brief  ", Some("A Book"), "note"),
            "brief\nA Book\nnote"
        );
    }

    #[test]
    fn test_missing_fallbacks_are_skipped() {
        assert_eq!(normalize_content("", None, "p.5"), "p.5");
        assert_eq!(normalize_content("", None, ""), "");
    }

    #[test]
    fn test_viable_content_is_only_trimmed() {
        let text = "  this text is comfortably long enough  ";
        assert_eq!(
            normalize_content(text, Some("ignored"), "ignored"),
            "this text is comfortably long enough"
        );
    }

    #[test]
    fn test_truncated_to_max_chars() {
        let long = "あ".repeat(MAX_CONTENT_CHARS + 100);
        let result = normalize_content(&long, None, "");
        assert_eq!(result.chars().count(), MAX_CONTENT_CHARS);
    }
}
