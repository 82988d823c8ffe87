//! Display text formatting: turns fetched counts into channel text.
//!
//! A target fed by several sources gets the parts concatenated with a
//! separator. When the combined text exceeds the configured maximum
//! display length it switches to an abbreviated form (short labels and
//! compact counts); as a last resort the text is hard-truncated.

/// One source's contribution to a target's display text.
#[derive(Debug, Clone)]
pub struct DisplayPart {
    pub label: String,
    pub short_label: String,
    pub count: u64,
}

/// `1234567` → `"1,234,567"`.
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `1234567` → `"1.2M"`, `43100` → `"43.1K"`, `980` → `"980"`.
pub fn abbreviate_count(n: u64) -> String {
    match n {
        0..=999 => n.to_string(),
        1_000..=999_999 => compact(n, 1_000, "K"),
        1_000_000..=999_999_999 => compact(n, 1_000_000, "M"),
        _ => compact(n, 1_000_000_000, "B"),
    }
}

fn compact(n: u64, unit: u64, suffix: &str) -> String {
    let whole = n / unit;
    let tenth = (n % unit) * 10 / unit;
    if tenth == 0 || whole >= 100 {
        format!("{}{}", whole, suffix)
    } else {
        format!("{}.{}{}", whole, tenth, suffix)
    }
}

/// Combine parts into the target's display text, honoring `max_len`.
pub fn compose(parts: &[DisplayPart], separator: &str, max_len: usize) -> String {
    let full = parts
        .iter()
        .map(|p| format!("{}: {} Followers", p.label, format_count(p.count)))
        .collect::<Vec<_>>()
        .join(separator);
    if full.chars().count() <= max_len {
        return full;
    }

    let short = parts
        .iter()
        .map(|p| format!("{} {}", p.short_label, abbreviate_count(p.count)))
        .collect::<Vec<_>>()
        .join(separator);
    if short.chars().count() <= max_len {
        return short;
    }
    short.chars().take(max_len).collect()
}
