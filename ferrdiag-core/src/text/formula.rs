use std::sync::LazyLock;

use regex::Regex;

use crate::{consts::DISPLAY_MATH_MIN_LEN, text::WHITESPACE};

static ENVIRONMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(begin|end)\{([A-Za-z]+\*?)\}").expect("Invalid environment regex")
});

/// Characters that only show up in math.
const STRONG_MARKERS: &[char] = &[
    '\\', '$', '^', '_', '∫', '∑', '√', '∞', '∂',
    '±', '×', '÷', '≤', '≥', '≠', '≈',
];

const OPERATORS: &[char] = &['+', '-', '*', '/', '=', '<', '>', '(', ')'];

/// Share of digits and operators an `=` expression needs to count as math.
const MATH_CHAR_RATIO: f32 = 0.25;

/// Whether recognized text reads as a formula rather than prose.
///
/// ```
/// use ferrdiag_core::text::formula::looks_like_formula;
/// assert!(looks_like_formula(r"\frac{a}{b}"));
/// assert!(looks_like_formula("E = mc^2"));
/// assert!(looks_like_formula("x + 1 = 3"));
/// assert!(!looks_like_formula("Status = done"));
/// assert!(!looks_like_formula("Start"));
/// ```
pub fn looks_like_formula(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    if text.contains(STRONG_MARKERS) {
        return true;
    }
    if !text.contains('=') {
        return false;
    }

    let (mut total, mut math) = (0usize, 0usize);
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if c.is_ascii_digit() || OPERATORS.contains(&c) {
            math += 1;
        }
    }
    math as f32 / total as f32 >= MATH_CHAR_RATIO
}

/// Canonical markup for a formula: delimiters stripped, braces balanced,
/// environments closed, then wrapped in `$...$` or `$$...$$` for long ones.
///
/// Returns `None` when nothing is left after cleanup.
pub fn normalize_notation(raw: &str) -> Option<String> {
    let collapsed = WHITESPACE.replace_all(raw.trim(), " ");
    let body = strip_delimiters(&collapsed);
    if body.is_empty() {
        return None;
    }

    let mut body = balance_braces(body);
    close_environments(&mut body);

    Some(if body.chars().count() > DISPLAY_MATH_MIN_LEN {
        format!("$${body}$$")
    } else {
        format!("${body}$")
    })
}

fn strip_delimiters(mut text: &str) -> &str {
    const PAIRS: [(&str, &str); 4] = [("$$", "$$"), (r"\[", r"\]"), (r"\(", r"\)"), ("$", "$")];
    loop {
        let stripped = PAIRS.iter().find_map(|(open, close)| {
            text.strip_prefix(open)
                .and_then(|rest| rest.strip_suffix(close))
        });
        match stripped {
            Some(inner) => text = inner.trim(),
            None => return text,
        }
    }
}

/// Drops unmatched `}` and appends the missing ones. Escaped braces are left alone.
fn balance_braces(text: &str) -> String {
    let mut balanced = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            balanced.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' if depth == 0 => continue,
            '}' => depth -= 1,
            _ => {}
        }
        balanced.push(c);
    }

    balanced.extend(std::iter::repeat_n('}', depth));
    balanced
}

fn close_environments(text: &mut String) {
    let mut open: Vec<String> = Vec::new();
    for capture in ENVIRONMENT.captures_iter(text) {
        let name = &capture[2];
        if &capture[1] == "begin" {
            open.push(name.to_string());
        } else if let Some(position) = open.iter().rposition(|env| env == name) {
            open.truncate(position);
        }
    }
    for name in open.iter().rev() {
        text.push_str(&format!(r"\end{{{name}}}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_heuristic() {
        assert!(looks_like_formula("a² + b² = c²"));
        assert!(looks_like_formula("∑ x"));
        assert!(looks_like_formula("$x$"));
        assert!(!looks_like_formula("Go to step 2"));
        assert!(!looks_like_formula(""));
        // `=` but mostly letters: 1 of 12 characters
        assert!(!looks_like_formula("result=valid"));
    }

    #[test]
    fn test_delimiters_are_replaced() {
        assert_eq!(normalize_notation(r"$$ x^2 $$").as_deref(), Some("$x^2$"));
        assert_eq!(normalize_notation(r"\[ \alpha \]").as_deref(), Some(r"$\alpha$"));
        assert_eq!(normalize_notation("  E = mc^2 ").as_deref(), Some("$E = mc^2$"));
        assert_eq!(normalize_notation("$$ $$"), None);
    }

    #[test]
    fn test_braces_are_balanced() {
        assert_eq!(normalize_notation(r"\frac{a}{b").as_deref(), Some(r"$\frac{a}{b}$"));
        assert_eq!(normalize_notation(r"x}^{2}").as_deref(), Some("$x^{2}$"));
        // Escaped braces are literal
        assert_eq!(normalize_notation(r"\{x\}").as_deref(), Some(r"$\{x\}$"));
    }

    #[test]
    fn test_environments_are_closed() {
        let notation = normalize_notation(r"\begin{pmatrix} a & b \begin{array}{c} 1").unwrap();
        assert!(notation
            .trim_end_matches('$')
            .ends_with(r"\end{array}\end{pmatrix}"));

        let closed = r"\begin{cases} a \end{cases}";
        assert_eq!(normalize_notation(closed), Some(format!("${closed}$")));
    }

    #[test]
    fn test_long_formula_is_display_math() {
        let long = r"\int_{0}^{\infty} e^{-x^2} dx = \frac{\sqrt{\pi}}{2} + \sum_{n=0}^{N} a_n";
        assert!(long.chars().count() > DISPLAY_MATH_MIN_LEN);
        let notation = normalize_notation(long).unwrap();
        assert!(notation.starts_with("$$") && notation.ends_with("$$"));
    }
}
