use std::time::Duration;

pub struct Utils {}

impl Utils {
    /// Diagnostic strings carried in outcomes never exceed this many characters.
    pub const MAX_DETAIL_CHARS: usize = 120;

    /// Quote an SQL identifier with double quotes, doubling any embedded quote.
    pub fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Truncate a diagnostic to `MAX_DETAIL_CHARS`, respecting char boundaries.
    pub fn bounded_detail(detail: impl Into<String>) -> String {
        let detail = detail.into();
        if detail.chars().count() <= Self::MAX_DETAIL_CHARS {
            return detail;
        }
        let mut truncated: String = detail.chars().take(Self::MAX_DETAIL_CHARS - 3).collect();
        truncated.push_str("...");
        truncated
    }

    /// Render a duration as `1h 02m 03s`, `4m 05s` or `6s`.
    pub fn format_elapsed(elapsed: Duration) -> String {
        let total = elapsed.as_secs();
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;

        if hours > 0 {
            format!("{}h {:02}m {:02}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {:02}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Group thousands with commas: 1234567 -> "1,234,567".
    pub fn format_count(count: u64) -> String {
        let digits = count.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push(',');
            }
            out.push(ch);
        }
        out
    }

    /// A date value the reorder protocol can compare as a plain string:
    /// exactly eight ASCII digits (`YYYYMMDD`).
    pub fn is_well_formed_date(value: &str) -> bool {
        value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit())
    }
}
