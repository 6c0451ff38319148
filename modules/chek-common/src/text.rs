//! Text helpers shared by the adapters and the item model. All truncation is
//! char-based: the corpus is CJK and the ingestion schema counts characters,
//! not bytes.

/// Collapse whitespace runs to single spaces, trim, and truncate to
/// `max_chars` with a trailing ellipsis when clipped.
pub fn safe_text(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars * 4));
    let mut last_was_space = true;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    let trimmed = out.trim_end();
    truncate_chars(trimmed, max_chars)
}

/// Normalize CRLF/CR to `\n`, trim, and truncate to `max_chars` with a
/// trailing ellipsis, keeping interior newlines (post bodies are multi-line).
pub fn clip_preserve_newlines(s: &str, max_chars: usize) -> String {
    let normalized = s.replace("\r\n", "\n").replace('\r', "\n");
    truncate_chars(normalized.trim(), max_chars)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 || s.is_empty() {
        return String::new();
    }
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

/// Order-preserving de-duplication by key. Items with empty keys are dropped.
pub fn uniq_by<T, F>(items: Vec<T>, key_fn: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let key = key_fn(&item);
        if key.is_empty() {
            continue;
        }
        if seen.insert(key) {
            out.push(item);
        }
    }
    out
}

/// Round-trip a URL through the parser to get a canonical form. Unparseable
/// input is returned unchanged so callers never lose the original reference.
pub fn normalize_url(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match url::Url::parse(trimmed) {
        Ok(u) => u.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

/// Strip the HTML the platforms embed in post text: `<br>`/`</p>` become
/// newlines, remaining tags are dropped, and the few entities they emit are
/// unescaped.
pub fn strip_html(s: &str) -> String {
    let breaks = regex::Regex::new(r"(?i)<br\s*/?>|</p>").expect("valid regex");
    let tags = regex::Regex::new(r"<[^>]+>").expect("valid regex");
    let with_newlines = breaks.replace_all(s, "\n");
    let stripped = tags.replace_all(&with_newlines, "");
    stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_text_collapses_whitespace_and_trims() {
        assert_eq!(safe_text("  汕头   宰客\n曝光  ", 80), "汕头 宰客 曝光");
    }

    #[test]
    fn safe_text_truncates_with_ellipsis_by_chars() {
        let s = "潮".repeat(10);
        let clipped = safe_text(&s, 5);
        assert_eq!(clipped.chars().count(), 5);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn clip_preserves_interior_newlines() {
        let clipped = clip_preserve_newlines("第一行\r\n第二行\r第三行", 100);
        assert_eq!(clipped, "第一行\n第二行\n第三行");
    }

    #[test]
    fn clip_under_limit_is_identity() {
        assert_eq!(clip_preserve_newlines("短文本", 100), "短文本");
    }

    #[test]
    fn uniq_by_keeps_first_and_drops_empty_keys() {
        let items = vec![("a", 1), ("", 2), ("b", 3), ("a", 4)];
        let out = uniq_by(items, |(k, _)| k.to_string());
        assert_eq!(out, vec![("a", 1), ("b", 3)]);
    }

    #[test]
    fn normalize_url_roundtrips_and_passes_through_garbage() {
        assert_eq!(
            normalize_url("https://weibo.com/1234/ABCdef"),
            "https://weibo.com/1234/ABCdef"
        );
        assert_eq!(normalize_url("not a url"), "not a url");
        assert_eq!(normalize_url("   "), "");
    }

    #[test]
    fn strip_html_converts_breaks_and_entities() {
        assert_eq!(
            strip_html("第一段<br/>第二段</p>尾部 &amp; <b>加粗</b>&nbsp;"),
            "第一段\n第二段\n尾部 & 加粗"
        );
    }
}
