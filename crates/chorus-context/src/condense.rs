//! Shrinking prior agent outputs to a token allotment.

use chorus_core::Tokenizer;

/// Appended to text cut by [`Condenser::truncate`].
pub const TRUNCATION_MARKER: &str = "[... truncated]";

/// Prefix of text produced by [`Condenser::summarize`].
pub const SUMMARY_PREFIX: &str = "[Summary]";

/// Words that suggest a sentence carries an outcome.
const OUTCOME_KEYWORDS: &[&str] = &[
    "result",
    "conclusion",
    "conclude",
    "recommend",
    "therefore",
    "summary",
    "finding",
    "key",
    "important",
    "answer",
    "solution",
    "decision",
];

/// Truncates and summarizes text against a tokenizer.
#[derive(Clone, Copy)]
pub struct Condenser<'tok> {
    tokenizer: &'tok dyn Tokenizer,
    model: &'tok str,
}

impl<'tok> Condenser<'tok> {
    /// Creates a condenser counting tokens for `model`.
    #[must_use]
    pub fn new(tokenizer: &'tok dyn Tokenizer, model: &'tok str) -> Self {
        Self { tokenizer, model }
    }

    /// Token count of `text`.
    #[must_use]
    pub fn count(&self, text: &str) -> usize {
        self.tokenizer.count_tokens(text, self.model).count
    }

    /// Whether `text` fits in `max_tokens`.
    #[must_use]
    pub fn fits(&self, text: &str, max_tokens: usize) -> bool {
        self.count(text) <= max_tokens
    }

    /// Cuts `text` at the last paragraph, sentence, or word boundary that fits
    /// `max_tokens` together with the truncation marker.
    ///
    /// Text that already fits is returned unchanged. Returns an empty string if
    /// not even the marker fits.
    #[must_use]
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.fits(text, max_tokens) {
            return text.to_owned();
        }
        if !self.fits(TRUNCATION_MARKER, max_tokens) {
            return String::new();
        }

        let ends = word_ends(text);
        let fitting = self.longest_fitting_prefix(text, &ends, max_tokens);
        let prefix = &text[..fitting];
        let cut = boundary_cut(prefix);
        let kept = prefix[..cut].trim_end();

        if kept.is_empty() {
            TRUNCATION_MARKER.to_owned()
        } else {
            format!("{kept}\n{TRUNCATION_MARKER}")
        }
    }

    /// Extractive summary: the highest-scoring sentences that fit `max_tokens`,
    /// in their original order, behind [`SUMMARY_PREFIX`].
    ///
    /// Sentences score one point per outcome keyword they contain; ties keep
    /// the earlier sentence.
    #[must_use]
    pub fn summarize(&self, text: &str, max_tokens: usize) -> String {
        if !self.fits(SUMMARY_PREFIX, max_tokens) {
            return String::new();
        }

        let sentences = split_sentences(text);
        let mut ranked: Vec<(usize, usize)> = sentences
            .iter()
            .enumerate()
            .map(|(index, sentence)| (index, outcome_score(sentence)))
            .collect();
        ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));

        // Sentence counts are summed rather than re-counting the joined text;
        // the sum never undercounts a whitespace-joined estimate.
        let mut used = self.count(SUMMARY_PREFIX);
        let mut chosen: Vec<usize> = Vec::new();
        for (index, _) in ranked {
            let cost = self.count(sentences[index]);
            if used + cost <= max_tokens {
                used += cost;
                chosen.push(index);
            }
        }
        chosen.sort_unstable();

        if chosen.is_empty() {
            let body_budget = max_tokens.saturating_sub(self.count(SUMMARY_PREFIX));
            let lead = sentences.first().copied().unwrap_or_default();
            let cut = self.truncate(lead, body_budget);
            if cut.is_empty() {
                return SUMMARY_PREFIX.to_owned();
            }
            return format!("{SUMMARY_PREFIX} {cut}");
        }

        render_summary(&sentences, &chosen)
    }

    /// Byte length of the longest word-aligned prefix that fits with the marker.
    fn longest_fitting_prefix(&self, text: &str, ends: &[usize], max_tokens: usize) -> usize {
        let fits_with_marker = |words: usize| {
            let end = if words == 0 { 0 } else { ends[words - 1] };
            self.fits(&format!("{}\n{TRUNCATION_MARKER}", &text[..end]), max_tokens)
        };

        let (mut low, mut high) = (0_usize, ends.len());
        while low < high {
            let mid = (low + high).div_ceil(2);
            if fits_with_marker(mid) {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        if low == 0 { 0 } else { ends[low - 1] }
    }
}

/// Byte offsets just past each whitespace-separated word.
fn word_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut in_word = false;
    for (index, character) in text.char_indices() {
        if character.is_whitespace() {
            if in_word {
                ends.push(index);
            }
            in_word = false;
        } else {
            in_word = true;
        }
    }
    if in_word {
        ends.push(text.len());
    }
    ends
}

/// Where to cut `prefix`: the last paragraph break, else the last sentence end,
/// else the whole prefix. A boundary that would discard more than half the
/// prefix is skipped in favour of the next finer one.
fn boundary_cut(prefix: &str) -> usize {
    let half = prefix.len() / 2;
    if let Some(paragraph) = prefix.rfind("\n\n")
        && paragraph >= half
    {
        return paragraph;
    }
    if let Some(sentence) = last_sentence_end(prefix)
        && sentence >= half
    {
        return sentence;
    }
    prefix.len()
}

/// Offset just past the last sentence terminator followed by whitespace or the end.
fn last_sentence_end(text: &str) -> Option<usize> {
    let mut last = None;
    let mut chars = text.char_indices().peekable();
    while let Some((index, character)) = chars.next() {
        if matches!(character, '.' | '!' | '?') {
            let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if at_boundary {
                last = Some(index + character.len_utf8());
            }
        }
    }
    last
}

/// Splits text into trimmed sentences on terminators and line breaks.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((index, character)) = chars.next() {
        let end = match character {
            '.' | '!' | '?' if chars.peek().is_none_or(|(_, next)| next.is_whitespace()) => {
                Some(index + character.len_utf8())
            }
            '\n' => Some(index),
            _ => None,
        };
        if let Some(end) = end {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Number of outcome keywords present in a sentence.
fn outcome_score(sentence: &str) -> usize {
    let lowered = sentence.to_lowercase();
    OUTCOME_KEYWORDS
        .iter()
        .filter(|keyword| lowered.contains(*keyword))
        .count()
}

fn render_summary(sentences: &[&str], chosen: &[usize]) -> String {
    let mut rendered = SUMMARY_PREFIX.to_owned();
    for index in chosen {
        rendered.push(' ');
        rendered.push_str(sentences[*index]);
    }
    rendered
}
