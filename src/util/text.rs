use std::borrow::Cow;
use std::collections::HashSet;

/// Returns true for bytes that must never reach storage: C0 controls other than
/// tab/newline/CR, DEL, and ESC.
fn is_control_byte(b: u8) -> bool {
    b == 0x1b || b == 0x7f || (b < 0x20 && b != 0x09 && b != 0x0a && b != 0x0d)
}

/// SEC-001: Strip control characters and ANSI escape sequences from feed text.
///
/// Feed XML is attacker-controlled; titles and descriptions end up in admin
/// tooling and search indexes, so escape sequences are removed at parse time.
///
/// Strips:
/// - ASCII control chars: 0x00-0x08, 0x0B-0x0C, 0x0E-0x1F, 0x7F
/// - ANSI CSI sequences: `\x1b[` ... (terminal byte 0x40-0x7E)
/// - ANSI OSC sequences: `\x1b]` ... (until BEL or ST `\x1b\\`)
/// - Bare ESC
///
/// Returns `Cow::Borrowed` when nothing needs stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if !bytes.iter().copied().any(is_control_byte) {
        return Cow::Borrowed(s);
    }

    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        match bytes[i] {
            0x1b if bytes.get(i + 1) == Some(&b'[') => {
                i += 2;
                while i < len {
                    let c = bytes[i];
                    i += 1;
                    if (0x40..=0x7e).contains(&c) {
                        break;
                    }
                }
            }
            0x1b if bytes.get(i + 1) == Some(&b']') => {
                i += 2;
                while i < len {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            b if is_control_byte(b) => i += 1,
            _ => {
                let start = i;
                while i < len && !is_control_byte(bytes[i]) {
                    i += 1;
                }
                // Only ASCII bytes terminate the run, so this is a char boundary.
                out.push_str(&s[start..i]);
            }
        }
    }

    Cow::Owned(out)
}

/// Remove markup tags from an HTML fragment, replacing each tag with a space.
///
/// This is not an HTML parser: it only needs to keep tag names and attribute
/// values out of the token stream.
pub fn strip_html(s: &str) -> Cow<'_, str> {
    if !s.contains('<') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    Cow::Owned(out)
}

/// Convert a label to a URL-safe slug: lowercase alphanumerics joined by single hyphens.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    let mut pending_hyphen = false;

    for c in s.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

// ============================================================================
// Tokenization
// ============================================================================

/// Turns free text into the lowercase token string stored as `extracted_text`.
///
/// Search indexing and the recommender consume the output; swapping in a
/// lemmatizing implementation only requires another impl of this trait.
pub trait Tokenizer: Send + Sync {
    /// Produce whitespace-joined tokens for `text` written in `language`
    /// (a two-letter code).
    fn tokenize(&self, language: &str, text: &str) -> String;
}

/// Minimum token length kept by [`StopWordTokenizer`].
const MIN_TOKEN_LEN: usize = 3;

const STOP_WORDS_EN: &[&str] = &[
    "about", "after", "again", "all", "also", "and", "any", "are", "because", "been", "before",
    "being", "between", "both", "but", "can", "could", "did", "does", "doing", "down", "during",
    "each", "episode", "episodes", "few", "for", "from", "further", "had", "has", "have",
    "having", "her", "here", "hers", "herself", "him", "himself", "his", "how", "into", "its",
    "itself", "just", "more", "most", "our", "ours", "ourselves", "out", "over", "own",
    "podcast", "podcasts", "same", "she", "should", "some", "such", "than", "that", "the",
    "their", "theirs", "them", "themselves", "then", "there", "these", "they", "this", "those",
    "through", "too", "under", "until", "very", "was", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours",
    "yourself", "yourselves", "week", "weekly", "show", "shows", "new", "every", "get",
];

const STOP_WORDS_DE: &[&str] = &[
    "aber", "als", "auch", "auf", "aus", "bei", "bin", "bis", "das", "dass", "dem", "den",
    "der", "des", "die", "ein", "eine", "einem", "einen", "einer", "eines", "folge", "für",
    "hat", "ich", "ihr", "ist", "mit", "nach", "nicht", "noch", "oder", "sich", "sie", "sind",
    "und", "uns", "von", "was", "wie", "wir", "zum", "zur",
];

const STOP_WORDS_ES: &[&str] = &[
    "como", "con", "del", "ella", "ellos", "episodio", "esta", "este", "hay", "las", "los",
    "más", "muy", "nos", "para", "pero", "por", "que", "sin", "sobre", "son", "una", "uno",
    "unos",
];

const STOP_WORDS_FR: &[&str] = &[
    "avec", "ces", "cette", "dans", "des", "elle", "est", "être", "ils", "les", "leur",
    "mais", "nous", "pas", "par", "pour", "que", "qui", "sans", "ses", "son", "sont", "sur",
    "une", "vous", "épisode",
];

/// Default [`Tokenizer`]: strips markup, lowercases, splits on non-alphanumerics,
/// drops short or numeric tokens and stop words for the feed language (falling
/// back to English for languages without a list).
#[derive(Debug, Clone)]
pub struct StopWordTokenizer {
    english: HashSet<&'static str>,
}

impl Default for StopWordTokenizer {
    fn default() -> Self {
        Self {
            english: STOP_WORDS_EN.iter().copied().collect(),
        }
    }
}

impl StopWordTokenizer {
    fn stop_words(language: &str) -> &'static [&'static str] {
        match language {
            "de" => STOP_WORDS_DE,
            "es" => STOP_WORDS_ES,
            "fr" => STOP_WORDS_FR,
            _ => STOP_WORDS_EN,
        }
    }

    fn is_stop_word(&self, language: &str, token: &str) -> bool {
        // English stop words also appear in non-English feeds (titles, brand names).
        self.english.contains(token) || Self::stop_words(language).contains(&token)
    }
}

impl Tokenizer for StopWordTokenizer {
    fn tokenize(&self, language: &str, text: &str) -> String {
        let text = strip_html(text);
        let lowered = text.to_lowercase();

        lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.chars().count() >= MIN_TOKEN_LEN)
            .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
            .filter(|token| !self.is_stop_word(language, token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
