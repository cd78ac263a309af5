//! Field normalization for feed content.
//!
//! One function per input field, each applied exactly once while an item or
//! channel is built. Fields whose failure matters to the caller return
//! [`Validated`]; total normalizations (explicit, language, categories) return
//! the value directly.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::models::{EpisodeType, PodcastType};
use crate::util::{normalize_url, slugify};

/// Outcome of validating a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validated<T> {
    Ok(T),
    Rejected(&'static str),
}

impl<T> Validated<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Default language when a feed declares none or an unsupported one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// ISO 639-1 codes accepted as a feed language.
const LANGUAGES: &[&str] = &[
    "aa", "ab", "af", "ak", "am", "an", "ar", "as", "av", "ay", "az", "ba", "be", "bg", "bh",
    "bi", "bm", "bn", "bo", "br", "bs", "ca", "ce", "ch", "co", "cr", "cs", "cu", "cv", "cy",
    "da", "de", "dv", "dz", "ee", "el", "en", "eo", "es", "et", "eu", "fa", "ff", "fi", "fj",
    "fo", "fr", "fy", "ga", "gd", "gl", "gn", "gu", "gv", "ha", "he", "hi", "ho", "hr", "ht",
    "hu", "hy", "hz", "ia", "id", "ie", "ig", "ii", "ik", "io", "is", "it", "iu", "ja", "jv",
    "ka", "kg", "ki", "kj", "kk", "kl", "km", "kn", "ko", "kr", "ks", "ku", "kv", "kw", "ky",
    "la", "lb", "lg", "li", "ln", "lo", "lt", "lu", "lv", "mg", "mh", "mi", "mk", "ml", "mn",
    "mr", "ms", "mt", "my", "na", "nb", "nd", "ne", "ng", "nl", "nn", "no", "nr", "nv", "ny",
    "oc", "oj", "om", "or", "os", "pa", "pi", "pl", "ps", "pt", "qu", "rm", "rn", "ro", "ru",
    "rw", "sa", "sc", "sd", "se", "sg", "si", "sk", "sl", "sm", "sn", "so", "sq", "sr", "ss",
    "st", "su", "sv", "sw", "ta", "te", "tg", "th", "ti", "tk", "tl", "tn", "to", "tr", "ts",
    "tt", "tw", "ty", "ug", "uk", "ur", "uz", "ve", "vi", "vo", "wa", "wo", "xh", "yi", "yo",
    "za", "zh", "zu",
];

/// Values of `itunes:explicit` that mark content as explicit.
const EXPLICIT_VALUES: &[&str] = &["clean", "yes", "true"];

/// Separators a category label is exploded on.
const CATEGORY_SEPARATORS: &[char] = &[' ', '/', '&', ',', '+'];

/// Normalize `itunes:duration`.
///
/// Accepts plain integer seconds (`"3600"`) or one to three `:`-separated
/// components (`"1:02:03"`), each in `0..=59`. Components are re-emitted
/// without zero padding.
pub fn duration(value: &str) -> Validated<String> {
    let value = value.trim();
    if value.is_empty() {
        return Validated::Rejected("empty duration");
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return Validated::Ok(seconds.to_string());
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() > 3 {
        return Validated::Rejected("too many duration components");
    }

    let mut components = Vec::with_capacity(parts.len());
    for part in parts {
        match part.trim().parse::<u8>() {
            Ok(n) if n < 60 => components.push(n.to_string()),
            _ => return Validated::Rejected("duration component out of range"),
        }
    }
    Validated::Ok(components.join(":"))
}

/// Normalize a URL field: missing schemes get `http://`, invalid URLs are rejected.
pub fn url(value: Option<&str>) -> Validated<String> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Validated::Rejected("missing URL"),
        Some(v) => match normalize_url(v) {
            Some(normalized) => Validated::Ok(normalized),
            None => Validated::Rejected("invalid URL"),
        },
    }
}

pub fn explicit(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        EXPLICIT_VALUES.iter().any(|e| v.eq_ignore_ascii_case(e))
    })
}

/// `itunes:complete` is only honoured when it says `yes`.
pub fn complete(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("yes"))
}

/// Lowercase, truncate to two characters, fall back to [`DEFAULT_LANGUAGE`].
pub fn language(value: Option<&str>) -> String {
    let code: String = value
        .unwrap_or_default()
        .trim()
        .to_lowercase()
        .chars()
        .take(2)
        .collect();

    if LANGUAGES.contains(&code.as_str()) {
        code
    } else {
        DEFAULT_LANGUAGE.to_owned()
    }
}

/// Explode category labels into a flat set of slugs.
///
/// `"Society &amp; Culture"` and `"Society and Culture"` both become
/// `{"society", "culture"}`.
pub fn categories<'a>(values: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut result = BTreeSet::new();

    for value in values {
        let folded = value
            .trim()
            .to_lowercase()
            .replace(" &amp; ", " & ")
            .replace(" and ", " & ");

        for token in folded.split(CATEGORY_SEPARATORS) {
            let slug = slugify(token);
            if !slug.is_empty() {
                result.insert(slug);
            }
        }
    }

    result
}

/// Reject missing and future publish dates.
pub fn pub_date(value: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Validated<DateTime<Utc>> {
    match value {
        None => Validated::Rejected("missing or unparseable publish date"),
        Some(date) if date > now => Validated::Rejected("publish date in the future"),
        Some(date) => Validated::Ok(date),
    }
}

/// Season and episode numbers must be positive integers.
pub fn positive_int(value: Option<&str>) -> Validated<i32> {
    match value.map(str::trim).map(str::parse::<i32>) {
        Some(Ok(n)) if n > 0 => Validated::Ok(n),
        Some(_) => Validated::Rejected("not a positive integer"),
        None => Validated::Rejected("missing"),
    }
}

/// Enclosure length in bytes.
pub fn file_size(value: Option<&str>) -> Validated<i64> {
    match value.map(str::trim).map(str::parse::<i64>) {
        Some(Ok(n)) if n >= 0 => Validated::Ok(n),
        Some(_) => Validated::Rejected("invalid length"),
        None => Validated::Rejected("missing"),
    }
}

pub fn episode_type(value: Option<&str>) -> EpisodeType {
    value
        .and_then(EpisodeType::from_feed_value)
        .unwrap_or_default()
}

pub fn podcast_type(value: Option<&str>) -> PodcastType {
    value
        .and_then(PodcastType::from_feed_value)
        .unwrap_or_default()
}
