use chrono::{DateTime, Utc};
use feed_rs::parser;
use thiserror::Error;

use super::extensions::{self, ChannelExtensions, ItemExtensions};
use super::models::{Feed, Item};
use super::validators;
use crate::util::strip_control_chars;

/// Media type assumed when neither the enclosure nor media:content declares one.
const DEFAULT_MEDIA_TYPE: &str = "audio/mpeg";

#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed XML, no feed root, or no item survived validation.
    #[error("Invalid RSS: {0}")]
    InvalidRss(String),
}

/// Parse and validate a feed document.
pub fn parse_feed(bytes: &[u8]) -> Result<Feed, ParseError> {
    parse_feed_at(bytes, Utc::now())
}

/// Parse relative to `now`, which bounds every accepted publish date.
pub fn parse_feed_at(bytes: &[u8], now: DateTime<Utc>) -> Result<Feed, ParseError> {
    let raw = parser::parse(bytes).map_err(|e| ParseError::InvalidRss(e.to_string()))?;
    let ext = extensions::scan(bytes).map_err(|e| ParseError::InvalidRss(e.to_string()))?;

    if raw.entries.is_empty() {
        return Err(ParseError::InvalidRss("feed has no items".to_string()));
    }
    if raw.entries.len() != ext.items.len() {
        tracing::debug!(
            entries = raw.entries.len(),
            scanned = ext.items.len(),
            "Extension scan out of step with parsed entries"
        );
    }

    let missing = ItemExtensions::default();
    let total = raw.entries.len();
    let mut items = Vec::with_capacity(total);

    for (index, entry) in raw.entries.iter().enumerate() {
        let item_ext = ext.items.get(index).unwrap_or(&missing);
        match build_item(entry, item_ext, now) {
            Ok(item) => items.push(item),
            Err(reason) => {
                tracing::debug!(index, entry_id = %entry.id, reason, "Dropping invalid item");
            }
        }
    }

    if items.is_empty() {
        return Err(ParseError::InvalidRss(format!(
            "none of {} items passed validation",
            total
        )));
    }
    if items.len() < total {
        tracing::debug!(kept = items.len(), total, "Some items were dropped");
    }

    Ok(build_feed(&raw, &ext.channel, items, now))
}

fn clean(text: &str) -> String {
    strip_control_chars(text.trim()).into_owned()
}

fn build_item(
    entry: &feed_rs::model::Entry,
    ext: &ItemExtensions,
    now: DateTime<Utc>,
) -> Result<Item, &'static str> {
    let media = entry.media.iter().flat_map(|m| m.content.iter());

    let media_url = ext
        .enclosure_url
        .clone()
        .or_else(|| {
            media
                .clone()
                .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
        });
    let media_url = match validators::url(media_url.as_deref()) {
        validators::Validated::Ok(url) => url,
        validators::Validated::Rejected(reason) => return Err(reason),
    };

    let pub_date = match validators::pub_date(entry.published.or(entry.updated), now) {
        validators::Validated::Ok(date) => date,
        validators::Validated::Rejected(reason) => return Err(reason),
    };

    let link = ext
        .link
        .clone()
        .or_else(|| {
            entry
                .links
                .iter()
                .find(|l| l.rel.as_deref() != Some("enclosure"))
                .map(|l| l.href.clone())
        });

    let guid = [ext.guid.as_deref(), link.as_deref(), Some(media_url.as_str())]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|g| !g.is_empty())
        .map(clean)
        .ok_or("empty guid")?;

    let title = entry
        .title
        .as_ref()
        .map(|t| clean(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let description = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .map(|d| clean(&d))
        .unwrap_or_default();

    let media_type = ext
        .enclosure_type
        .clone()
        .or_else(|| {
            media
                .clone()
                .find_map(|c| c.content_type.as_ref().map(|m| m.to_string()))
        })
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());

    let file_size = validators::file_size(ext.enclosure_length.as_deref())
        .ok()
        .or_else(|| media.clone().find_map(|c| c.size).and_then(|s| i64::try_from(s).ok()));

    Ok(Item {
        guid,
        title,
        description,
        pub_date,
        media_url,
        media_type,
        file_size,
        duration: ext
            .duration
            .as_deref()
            .and_then(|d| validators::duration(d).ok())
            .unwrap_or_default(),
        explicit: validators::explicit(ext.explicit.as_deref()),
        season: validators::positive_int(ext.season.as_deref()).ok(),
        episode: validators::positive_int(ext.episode.as_deref()).ok(),
        episode_type: validators::episode_type(ext.episode_type.as_deref()),
        website: validators::url(link.as_deref()).ok(),
        cover_url: validators::url(ext.image.as_deref()).ok(),
        keywords: ext.keywords.as_deref().map(clean).unwrap_or_default(),
    })
}

fn build_feed(
    raw: &feed_rs::model::Feed,
    ext: &ChannelExtensions,
    items: Vec<Item>,
    now: DateTime<Utc>,
) -> Feed {
    let owner = ext
        .owner_name
        .clone()
        .or_else(|| ext.author.clone())
        .or_else(|| raw.authors.first().map(|p| p.name.clone()))
        .map(|o| clean(&o))
        .unwrap_or_default();

    let website = raw
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .and_then(|l| validators::url(Some(&l.href)).ok());

    let cover = ext
        .image
        .clone()
        .or_else(|| raw.logo.as_ref().map(|i| i.uri.clone()))
        .or_else(|| raw.icon.as_ref().map(|i| i.uri.clone()));

    let feed_categories = raw.categories.iter().map(|c| c.term.as_str());
    let categories =
        validators::categories(ext.categories.iter().map(String::as_str).chain(feed_categories));

    // An explicit channel date wins unless it lies in the future.
    let pub_date = raw
        .published
        .filter(|d| *d <= now)
        .or_else(|| items.iter().map(|i| i.pub_date).max());

    Feed {
        title: raw
            .title
            .as_ref()
            .map(|t| clean(&t.content))
            .unwrap_or_default(),
        description: raw
            .description
            .as_ref()
            .map(|d| clean(&d.content))
            .unwrap_or_default(),
        owner,
        website,
        cover_url: validators::url(cover.as_deref()).ok(),
        funding_url: validators::url(ext.funding_url.as_deref()).ok(),
        funding_text: ext.funding_text.as_deref().map(clean).unwrap_or_default(),
        language: validators::language(raw.language.as_deref()),
        explicit: validators::explicit(ext.explicit.as_deref()),
        complete: validators::complete(ext.complete.as_deref()),
        podcast_type: validators::podcast_type(ext.podcast_type.as_deref()),
        canonical_url: validators::url(ext.new_feed_url.as_deref()).ok(),
        pub_date,
        keywords: ext.keywords.as_deref().map(clean).unwrap_or_default(),
        categories,
        items,
    }
}
