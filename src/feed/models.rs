use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// Number of item titles folded into the feed's token text.
const TOKENIZED_ITEM_TITLES: usize = 6;

/// `itunes:episodeType`. Unknown values fall back to [`EpisodeType::Full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpisodeType {
    #[default]
    Full,
    Trailer,
    Bonus,
}

impl EpisodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Trailer => "trailer",
            Self::Bonus => "bonus",
        }
    }

    /// Case-insensitive match against the known choices.
    pub fn from_feed_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "trailer" => Some(Self::Trailer),
            "bonus" => Some(Self::Bonus),
            _ => None,
        }
    }
}

impl fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `itunes:type`. Unknown values fall back to [`PodcastType::Episodic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodcastType {
    #[default]
    Episodic,
    Serial,
}

impl PodcastType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Serial => "serial",
        }
    }

    pub fn from_feed_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "episodic" => Some(Self::Episodic),
            "serial" => Some(Self::Serial),
            _ => None,
        }
    }
}

impl fmt::Display for PodcastType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated feed entry. Becomes exactly one episode row once persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub guid: String,
    pub title: String,
    pub description: String,
    pub pub_date: DateTime<Utc>,
    pub media_url: String,
    pub media_type: String,
    pub file_size: Option<i64>,
    /// Normalized duration: integer seconds or up to three `:` components; empty if invalid.
    pub duration: String,
    pub explicit: bool,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub episode_type: EpisodeType,
    pub website: Option<String>,
    pub cover_url: Option<String>,
    pub keywords: String,
}

/// A parsed and validated podcast feed.
///
/// Guaranteed to hold at least one item.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub title: String,
    pub description: String,
    pub owner: String,
    pub website: Option<String>,
    pub cover_url: Option<String>,
    pub funding_url: Option<String>,
    pub funding_text: String,
    /// Two-letter language code.
    pub language: String,
    pub explicit: bool,
    /// `itunes:complete`: the publisher will not add further episodes.
    pub complete: bool,
    pub podcast_type: PodcastType,
    /// Redirect target declared by the feed itself (`itunes:new-feed-url`).
    pub canonical_url: Option<String>,
    pub pub_date: Option<DateTime<Utc>>,
    pub keywords: String,
    /// Slugified category tokens.
    pub categories: BTreeSet<String>,
    pub items: Vec<Item>,
}

impl Feed {
    /// Source text for `extracted_text`: title, description, owner,
    /// categories, keywords and the first few item titles.
    pub fn token_source(&self) -> String {
        let mut parts: Vec<&str> = vec![&self.title, &self.description, &self.owner];
        parts.extend(self.categories.iter().map(String::as_str));
        parts.push(&self.keywords);
        parts.extend(
            self.items
                .iter()
                .take(TOKENIZED_ITEM_TITLES)
                .map(|item| item.title.as_str()),
        );
        parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Publish dates of every item, in feed order.
    pub fn item_dates(&self) -> Vec<DateTime<Utc>> {
        self.items.iter().map(|item| item.pub_date).collect()
    }
}
