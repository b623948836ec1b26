//! Rewrites model output as plain ASCII, spelling mathematical symbols out
//! in words of the target language.

/// `(symbol, italian, english)`
const SYMBOL_WORDS: &[(char, &str, &str)] = &[
    ('∈', "appartiene a", "belongs to"),
    ('∉', "non appartiene a", "does not belong to"),
    ('⊂', "e' sottoinsieme di", "is a subset of"),
    ('⊆', "e' sottoinsieme di", "is a subset of"),
    ('∪', "unione", "union"),
    ('∩', "intersezione", "intersection"),
    ('∀', "per ogni", "for all"),
    ('∃', "esiste", "there exists"),
    ('→', "implica", "implies"),
    ('⇒', "implica", "implies"),
    ('⇔', "se e solo se", "if and only if"),
    ('↔', "se e solo se", "if and only if"),
    ('≤', "minore o uguale a", "less than or equal to"),
    ('≥', "maggiore o uguale a", "greater than or equal to"),
    ('≠', "diverso da", "not equal to"),
    ('≈', "circa uguale a", "approximately equal to"),
    ('∞', "infinito", "infinity"),
    ('√', "radice quadrata di", "square root of"),
    ('∑', "sommatoria di", "sum of"),
    ('∫', "integrale di", "integral of"),
    ('∂', "derivata parziale di", "partial derivative of"),
    ('∅', "insieme vuoto", "empty set"),
    ('±', "piu' o meno", "plus or minus"),
    ('×', "per", "times"),
    ('÷', "diviso", "divided by"),
    ('²', "al quadrato", "squared"),
    ('³', "al cubo", "cubed"),
    ('°', "gradi", "degrees"),
    ('π', "pi greco", "pi"),
    ('Δ', "delta", "delta"),
    ('α', "alfa", "alpha"),
    ('β', "beta", "beta"),
    ('γ', "gamma", "gamma"),
    ('λ', "lambda", "lambda"),
    ('μ', "mu", "mu"),
    ('σ', "sigma", "sigma"),
    ('θ', "theta", "theta"),
    ('ω', "omega", "omega"),
];

/// Typographic characters with a direct ASCII equivalent.
fn punctuation(c: char) -> Option<&'static str> {
    Some(match c {
        '‘' | '’' | '′' => "'",
        '“' | '”' | '«' | '»' | '″' => "\"",
        '–' | '—' | '−' => "-",
        '…' => "...",
        '\u{a0}' => " ",
        _ => return None,
    })
}

/// Accented Latin letters. Italian keeps the accent as a trailing apostrophe.
fn fold_letter(c: char, italian: bool) -> Option<&'static str> {
    let (plain, apostrophe) = match c {
        'à' | 'á' | 'â' | 'ä' | 'ã' => ("a", "a'"),
        'è' | 'é' | 'ê' | 'ë' => ("e", "e'"),
        'ì' | 'í' | 'î' | 'ï' => ("i", "i'"),
        'ò' | 'ó' | 'ô' | 'ö' | 'õ' => ("o", "o'"),
        'ù' | 'ú' | 'û' | 'ü' => ("u", "u'"),
        'À' | 'Á' | 'Â' | 'Ä' => ("A", "A'"),
        'È' | 'É' | 'Ê' | 'Ë' => ("E", "E'"),
        'Ì' | 'Í' => ("I", "I'"),
        'Ò' | 'Ó' | 'Ö' => ("O", "O'"),
        'Ù' | 'Ú' | 'Ü' => ("U", "U'"),
        'ç' => ("c", "c"),
        'ñ' => ("n", "n"),
        'ß' => ("ss", "ss"),
        _ => return None,
    };
    Some(if italian { apostrophe } else { plain })
}

pub fn is_italian(language: &str) -> bool {
    let language = language.trim().to_ascii_lowercase();
    language == "it" || language.starts_with("it-") || language.starts_with("ital")
}

/// Returns an ASCII-only rendering of `text`.
///
/// Symbols become words ("x ∈ A" -> "x appartiene ad A" in Italian), accented
/// letters are folded, and any other non-ASCII character is dropped.
pub fn to_ascii_words(text: &str, language: &str) -> String {
    let italian = is_italian(language);
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        if let Some(&(_, it, en)) = SYMBOL_WORDS.iter().find(|(symbol, _, _)| *symbol == c) {
            if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                out.push(' ');
            }
            out.push_str(if italian { it } else { en });
            let next = next_word_start(&chars[i + 1..], italian);
            if italian && ends_with_bare_preposition(&out) && next.is_some_and(is_vowel) {
                // Euphonic "d": "appartiene a A" reads "appartiene ad A".
                out.push('d');
            }
            if chars.get(i + 1).is_some_and(|n| !n.is_whitespace()) {
                out.push(' ');
            }
            continue;
        }
        if let Some(replacement) = punctuation(c).or_else(|| fold_letter(c, italian)) {
            out.push_str(replacement);
        }
    }

    collapse_spaces(&out)
}

/// First letter of the next word, looking through symbols to the word they become.
fn next_word_start(rest: &[char], italian: bool) -> Option<char> {
    let next = *rest.iter().find(|c| !c.is_whitespace())?;
    match SYMBOL_WORDS.iter().find(|(symbol, _, _)| *symbol == next) {
        Some(&(_, it, en)) => (if italian { it } else { en }).chars().next(),
        None => Some(next),
    }
}

fn ends_with_bare_preposition(text: &str) -> bool {
    text.ends_with(" a") || text == "a"
}

fn is_vowel(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u')
}

fn collapse_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_space = false;
    for c in text.chars() {
        let is_space = c == ' ';
        if !(is_space && previous_space) {
            out.push(c);
        }
        previous_space = is_space;
    }
    out.trim().to_string()
}
