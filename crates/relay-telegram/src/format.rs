/// Escape text for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Keep whole lines while the reply fits in `limit` chars.
///
/// Replies are built one self-contained HTML line at a time, so cutting on a
/// line boundary never leaves a tag open.
pub fn clip_lines(html: &str, limit: usize) -> String {
    if html.chars().count() <= limit {
        return html.to_string();
    }
    const MORE: &str = "\n…";
    let budget = limit.saturating_sub(MORE.chars().count());

    let mut out = String::new();
    let mut used = 0usize;
    for line in html.lines() {
        let cost = line.chars().count() + usize::from(!out.is_empty());
        if used + cost > budget {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
        used += cost;
    }
    out.push_str(MORE);
    out
}
