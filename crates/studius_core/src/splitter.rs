//! The Section Splitter.
//!
//! Partitions a long document into ordered sections small enough for one model
//! call. Sections are contiguous slices of the input: concatenating them gives
//! back the original text byte for byte.

use once_cell::sync::Lazy;
use regex::Regex;

/// Documents up to this many characters use the `small` tier.
pub const SMALL_DOCUMENT_CHARS: usize = 60_000;
/// Documents up to this many characters use the `medium` tier.
pub const MEDIUM_DOCUMENT_CHARS: usize = 200_000;

/// Paragraph or sentence splitting is only trusted with at least this many units.
const MIN_UNITS: usize = 3;

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("paragraph pattern is valid"));
static SENTENCE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.!?;]+["')\]]*\s+"#).expect("sentence pattern is valid"));

/// Section sizing for one document length band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitTier {
    pub target_chars: usize,
    pub max_sections: usize,
}

impl SplitTier {
    pub const SMALL: SplitTier = SplitTier {
        target_chars: 15_000,
        max_sections: 8,
    };
    pub const MEDIUM: SplitTier = SplitTier {
        target_chars: 8_000,
        max_sections: 20,
    };
    pub const LARGE: SplitTier = SplitTier {
        target_chars: 5_000,
        max_sections: 30,
    };

    /// Larger documents get smaller sections and a higher, but capped, count.
    pub fn for_length(total_chars: usize) -> Self {
        if total_chars <= SMALL_DOCUMENT_CHARS {
            Self::SMALL
        } else if total_chars <= MEDIUM_DOCUMENT_CHARS {
            Self::MEDIUM
        } else {
            Self::LARGE
        }
    }

    /// A section is only closed early once it holds at least this much text.
    pub fn min_chars(&self) -> usize {
        self.target_chars / 5
    }
}

/// Splits `text` into sections sized for the tier selected by `total_length`
/// (the document length in characters).
///
/// Every section but the last holds at most `target_chars` characters. When
/// the text would need more than `max_sections`, the overflow is merged into
/// the last section instead of being dropped.
pub fn split(text: &str, total_length: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let tier = SplitTier::for_length(total_length);
    let units = select_units(text, tier);
    let mut sections = accumulate(&units, tier);

    if sections.len() > tier.max_sections {
        let overflow = sections.split_off(tier.max_sections - 1);
        sections.push(overflow.concat());
    }
    sections
}

/// Paragraphs first, then sentences, then fixed-width slices.
fn select_units(text: &str, tier: SplitTier) -> Vec<&str> {
    let paragraphs = units_by(text, &PARAGRAPH_BREAK);
    let oversized = paragraphs
        .iter()
        .any(|p| char_len(p) > tier.target_chars * 2);
    if paragraphs.len() >= MIN_UNITS && !oversized {
        return paragraphs;
    }

    let sentences = units_by(text, &SENTENCE_BREAK);
    if sentences.len() >= MIN_UNITS {
        return sentences;
    }

    char_slices(text, tier.target_chars)
}

/// Cuts `text` right after every match of `boundary`, so each unit keeps its
/// own trailing separator.
fn units_by<'a>(text: &'a str, boundary: &Regex) -> Vec<&'a str> {
    let mut units = Vec::new();
    let mut start = 0;
    for m in boundary.find_iter(text) {
        if m.end() > start {
            units.push(&text[start..m.end()]);
            start = m.end();
        }
    }
    if start < text.len() {
        units.push(&text[start..]);
    }
    units
}

fn char_slices(text: &str, width: usize) -> Vec<&str> {
    let mut slices = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let (head, tail) = split_at_char(rest, width);
        slices.push(head);
        rest = tail;
    }
    slices
}

fn accumulate(units: &[&str], tier: SplitTier) -> Vec<String> {
    let mut sections = Vec::new();
    let mut buffer = String::new();
    let mut buffer_chars = 0;

    for unit in units {
        let mut rest = *unit;
        loop {
            let rest_chars = char_len(rest);
            if buffer_chars + rest_chars <= tier.target_chars {
                buffer.push_str(rest);
                buffer_chars += rest_chars;
                break;
            }
            if buffer_chars >= tier.min_chars() {
                sections.push(std::mem::take(&mut buffer));
                buffer_chars = 0;
                continue;
            }
            // Too little text to close the section: top it up to the target
            // with the head of this unit and carry the tail forward.
            let (head, tail) = split_at_char(rest, tier.target_chars - buffer_chars);
            buffer.push_str(head);
            sections.push(std::mem::take(&mut buffer));
            buffer_chars = 0;
            rest = tail;
        }
    }
    if !buffer.is_empty() {
        sections.push(buffer);
    }
    sections
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits after `n` characters (or at the end), never inside a UTF-8 sequence.
fn split_at_char(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((byte, _)) => text.split_at(byte),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(text: &str) -> Vec<String> {
        split(text, text.chars().count())
    }

    fn paragraph(seed: usize, chars: usize) -> String {
        let sentence = format!("Il paragrafo {seed} descrive la termodinamica classica. ");
        let mut p = sentence.repeat(chars / sentence.len() + 1);
        p.truncate(chars);
        p
    }

    #[test]
    fn sections_reconstruct_the_original_text() {
        let text: String = (0..40)
            .map(|i| format!("{}\n\n", paragraph(i, 1_700 + i * 37)))
            .collect();
        let sections = split_all(&text);

        assert!(sections.len() > 1);
        assert_eq!(sections.concat(), text);
    }

    #[test]
    fn tiers_follow_document_length() {
        assert_eq!(SplitTier::for_length(10_000), SplitTier::SMALL);
        assert_eq!(SplitTier::for_length(150_000), SplitTier::MEDIUM);
        assert_eq!(SplitTier::for_length(400_000), SplitTier::LARGE);
    }

    #[test]
    fn large_document_is_capped_at_thirty_sections() {
        let mut text = String::new();
        let mut i = 0;
        while text.len() < 400_000 {
            text.push_str(&paragraph(i, 1_200));
            text.push_str("\n\n");
            i += 1;
        }
        text.truncate(400_000);

        let sections = split_all(&text);
        assert_eq!(sections.len(), SplitTier::LARGE.max_sections);
        for section in &sections[..sections.len() - 1] {
            assert!(section.chars().count() <= 5_000);
        }
        // The overflow lives in the last section rather than being dropped.
        assert!(sections.last().unwrap().chars().count() > 5_000);
        assert_eq!(sections.concat(), text);
    }

    #[test]
    fn small_document_stays_whole() {
        let text = "Una breve introduzione.\n\nDue paragrafi soltanto.";
        assert_eq!(split_all(text), vec![text.to_string()]);
    }

    #[test]
    fn oversized_paragraphs_fall_back_to_sentences() {
        // One huge paragraph: no blank lines at all.
        let text = paragraph(1, 50_000);
        let sections = split_all(&text);

        assert!(sections.len() >= 3);
        for section in &sections {
            assert!(section.chars().count() <= SplitTier::SMALL.target_chars);
        }
        // Every section but the last closes on a sentence boundary.
        for section in &sections[..sections.len() - 1] {
            assert!(section.ends_with(". "));
        }
        assert_eq!(sections.concat(), text);
    }

    #[test]
    fn unpunctuated_text_is_sliced_by_width() {
        let text = "abcdefghij".repeat(4_000);
        let sections = split_all(&text);

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].len(), 15_000);
        assert_eq!(sections.concat(), text);
    }

    #[test]
    fn multibyte_text_is_never_cut_mid_character() {
        let text = "è∈àπ".repeat(10_000);
        let sections = split_all(&text);

        assert!(sections.len() > 1);
        assert_eq!(sections.concat(), text);
    }

    #[test]
    fn blank_input_yields_no_sections() {
        assert!(split_all("  \n\n \t").is_empty());
        assert!(split_all("").is_empty());
    }
}
