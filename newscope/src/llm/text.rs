//! Text normalization for model output and the local fallback summary.
//!
//! Cleanup is expressed as an ordered list of [`StripRule`]s; each rule is a plain
//! function over the text so it can be tested on its own.

/// Default character cap of the fallback summary
pub const DEFAULT_FALLBACK_CHARS: usize = 300;

const EMPTY_TEXT_SUMMARY: &str = "No text to summarize.";
const ELLIPSIS: &str = "...";

/// One cleanup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripRule {
    /// `<think>...</think>` reasoning blocks emitted by local models
    ThinkBlocks,
    /// A leading "Here is a summary:" style line, or a "Summary:" prefix
    Preamble,
    /// Headings, quote and bullet markers, emphasis and code markers
    MarkdownMarkers,
    /// Signed or decimal numbers, and lines made only of numbers
    NumericNoise,
    /// Collapse every whitespace run into a single space
    Whitespace,
}

/// Rules applied to text returned by a provider
pub const MODEL_OUTPUT_RULES: &[StripRule] = &[
    StripRule::ThinkBlocks,
    StripRule::Preamble,
    StripRule::MarkdownMarkers,
    StripRule::Whitespace,
];

/// Rules applied to raw article text before extracting a fallback summary
pub const FALLBACK_RULES: &[StripRule] = &[
    StripRule::MarkdownMarkers,
    StripRule::NumericNoise,
    StripRule::Whitespace,
];

impl StripRule {
    pub fn apply(self, text: &str) -> String {
        match self {
            Self::ThinkBlocks => strip_think_blocks(text),
            Self::Preamble => strip_preamble(text),
            Self::MarkdownMarkers => strip_markdown(text),
            Self::NumericNoise => strip_numeric_noise(text),
            Self::Whitespace => text.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }
}

/// Apply `rules` in order.
pub fn normalize(text: &str, rules: &[StripRule]) -> String {
    rules
        .iter()
        .fold(text.to_string(), |acc, rule| rule.apply(&acc))
}

pub fn clean_model_output(text: &str) -> String {
    normalize(text, MODEL_OUTPUT_RULES)
}

/// Extractive summary computed locally. Never empty, never fails.
///
/// Keeps the first two sentences of the cleaned text, or its first `max_chars`
/// characters, whichever is shorter.
pub fn fallback_summary(text: &str, max_chars: usize) -> String {
    let cleaned = normalize(text, FALLBACK_RULES);
    if cleaned.is_empty() {
        return EMPTY_TEXT_SUMMARY.to_string();
    }

    let sentences = first_sentences(&cleaned, 2);
    let truncated = truncate_words(&cleaned, max_chars.max(1));

    let summary = if sentences.chars().count() <= truncated.chars().count() {
        sentences
    } else {
        truncated
    };
    if summary.is_empty() {
        EMPTY_TEXT_SUMMARY.to_string()
    } else {
        summary
    }
}

fn strip_think_blocks(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        match rest[start..].find(CLOSE) {
            Some(end) => rest = &rest[start + end + CLOSE.len()..],
            // unterminated block: the model never got to the answer
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn strip_preamble(text: &str) -> String {
    let trimmed = text.trim_start();
    let (first, rest) = match trimmed.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };

    let head = first.trim_matches(|c: char| c == '#' || c == '*' || c.is_whitespace());
    let lower = head.to_lowercase();
    // only a trailing colon: "Summary: the council approved:" is content
    let is_intro = lower.ends_with(':')
        && !lower[..lower.len() - 1].contains(':')
        && ["here is", "here's", "sure", "summary", "résumé", "voici"]
            .iter()
            .any(|p| lower.starts_with(p));
    if is_intro {
        return rest.to_string();
    }

    for prefix in ["summary:", "résumé :", "résumé:"] {
        if lower.starts_with(prefix) {
            let cut = head
                .char_indices()
                .nth(prefix.chars().count())
                .map(|(i, _)| i)
                .unwrap_or(head.len());
            return format!("{}\n{}", head[cut..].trim_start(), rest);
        }
    }
    trimmed.to_string()
}

fn strip_markdown(text: &str) -> String {
    text.lines()
        .map(|line| {
            let mut line = line.trim_start();
            line = line.trim_start_matches('#').trim_start_matches('>').trim_start();
            for bullet in ["- ", "* ", "+ "] {
                if let Some(stripped) = line.strip_prefix(bullet) {
                    line = stripped;
                    break;
                }
            }
            line.replace("**", "").replace("__", "").replace('`', "")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_numeric_noise(text: &str) -> String {
    text.lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                return Some(String::new());
            }
            if tokens.iter().all(|t| is_numeric(t)) {
                return None;
            }
            let mut kept: Vec<String> = Vec::with_capacity(tokens.len());
            for token in tokens {
                if !is_numeric_noise(token) {
                    kept.push(token.to_string());
                    continue;
                }
                // a dropped number may end its sentence; the stop moves to the previous word
                let stop = token.chars().last().filter(|c| matches!(c, '.' | '!' | '?'));
                if let (Some(stop), Some(prev)) = (stop, kept.last_mut()) {
                    if !prev.ends_with(['.', '!', '?']) {
                        prev.push(stop);
                    }
                }
            }
            Some(kept.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Digits with optional sign, currency symbol, separators, percent and trailing punctuation.
fn numeric_parts(token: &str) -> Option<(bool, &str)> {
    let token = token.trim_end_matches([',', ';', ':', ')', '(', '.']);
    let token = token.trim_start_matches('(');
    let token = token.strip_suffix('%').unwrap_or(token);
    let (signed, body) = match token.strip_prefix(['+', '-', '−']) {
        Some(body) => (true, body),
        None => (false, token),
    };
    let body = body.trim_start_matches(['$', '€', '£']);
    let starts_with_digit = body.chars().next().is_some_and(|c| c.is_ascii_digit());
    let well_formed = body.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',');
    (starts_with_digit && well_formed).then_some((signed, body))
}

fn is_numeric(token: &str) -> bool {
    numeric_parts(token).is_some()
}

/// Signed or fractional numbers such as `-452.44` or `+478.00`; plain integers are kept.
fn is_numeric_noise(token: &str) -> bool {
    matches!(numeric_parts(token), Some((signed, body)) if signed || body.contains('.'))
}

fn first_sentences(text: &str, count: usize) -> String {
    let mut seen = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                seen += 1;
                if seen == count {
                    return text[..i + c.len_utf8()].trim().to_string();
                }
            }
        }
    }
    text.trim().to_string()
}

fn truncate_words(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }

    let budget = max_chars - ELLIPSIS.len();
    let head: String = text.chars().take(budget).collect();
    let cut = match head.rfind(' ') {
        Some(space) if space > 0 => &head[..space],
        _ => head.as_str(),
    };
    format!("{}{}", cut.trim_end_matches([' ', ',', ';', ':']), ELLIPSIS)
}
