//! Second pass over the raw feed XML for podcast-specific elements.
//!
//! `feed-rs` models RSS/Atom/JSON Feed but drops most of the iTunes and
//! Podcasting 2.0 namespaces. This scanner walks the document once with
//! `quick-xml` and collects those elements per channel and per item, in
//! document order, so they can be zipped with the `feed-rs` entries.

use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Raw channel-level extension values. Nothing here is validated yet.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChannelExtensions {
    pub explicit: Option<String>,
    pub podcast_type: Option<String>,
    pub complete: Option<String>,
    pub new_feed_url: Option<String>,
    pub keywords: Option<String>,
    pub author: Option<String>,
    pub owner_name: Option<String>,
    /// `itunes:category/@text`, subcategories included.
    pub categories: Vec<String>,
    pub image: Option<String>,
    pub funding_url: Option<String>,
    pub funding_text: Option<String>,
}

/// Raw item-level extension values.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ItemExtensions {
    /// `guid` (RSS) or `id` (Atom) exactly as published.
    pub guid: Option<String>,
    pub link: Option<String>,
    pub enclosure_url: Option<String>,
    pub enclosure_type: Option<String>,
    pub enclosure_length: Option<String>,
    pub duration: Option<String>,
    pub explicit: Option<String>,
    pub episode_type: Option<String>,
    pub season: Option<String>,
    pub episode: Option<String>,
    pub image: Option<String>,
    pub keywords: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Extensions {
    pub channel: ChannelExtensions,
    /// One entry per `item`/`entry` element, in document order.
    pub items: Vec<ItemExtensions>,
}

fn is_item(name: &[u8]) -> bool {
    name == b"item" || name == b"entry"
}

/// First non-empty, unescaped value of attribute `key`.
fn attribute(e: &BytesStart<'_>, decoder: Decoder, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.decode_and_unescape_value(decoder).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn set_once(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Handle the attribute-carrying elements, whether self-closing or not.
fn on_element(
    e: &BytesStart<'_>,
    decoder: Decoder,
    item: Option<&mut ItemExtensions>,
    channel: &mut ChannelExtensions,
) {
    let name = e.name();
    match (name.as_ref(), item) {
        (b"enclosure", Some(item)) => {
            set_once(&mut item.enclosure_url, attribute(e, decoder, b"url"));
            set_once(&mut item.enclosure_type, attribute(e, decoder, b"type"));
            set_once(&mut item.enclosure_length, attribute(e, decoder, b"length"));
        }
        (b"link", Some(item)) => {
            let rel = attribute(e, decoder, b"rel");
            match rel.as_deref() {
                Some("enclosure") => {
                    set_once(&mut item.enclosure_url, attribute(e, decoder, b"href"));
                    set_once(&mut item.enclosure_type, attribute(e, decoder, b"type"));
                    set_once(&mut item.enclosure_length, attribute(e, decoder, b"length"));
                }
                None | Some("alternate") => {
                    set_once(&mut item.link, attribute(e, decoder, b"href"));
                }
                _ => {}
            }
        }
        (b"itunes:image", Some(item)) => set_once(&mut item.image, attribute(e, decoder, b"href")),
        (b"itunes:image", None) => set_once(&mut channel.image, attribute(e, decoder, b"href")),
        (b"itunes:category", None) => {
            if let Some(text) = attribute(e, decoder, b"text") {
                channel.categories.push(text);
            }
        }
        (b"podcast:funding", None) => {
            set_once(&mut channel.funding_url, attribute(e, decoder, b"url"));
        }
        _ => {}
    }
}

/// Assign collected element text to the matching field.
fn on_text(
    name: &[u8],
    parent: Option<&[u8]>,
    text: String,
    item: Option<&mut ItemExtensions>,
    channel: &mut ChannelExtensions,
) {
    if text.is_empty() {
        return;
    }
    let value = Some(text);

    match item {
        Some(item) => match name {
            b"guid" | b"id" => set_once(&mut item.guid, value),
            b"link" => set_once(&mut item.link, value),
            b"itunes:duration" => set_once(&mut item.duration, value),
            b"itunes:explicit" => set_once(&mut item.explicit, value),
            b"itunes:episodeType" => set_once(&mut item.episode_type, value),
            b"itunes:season" => set_once(&mut item.season, value),
            b"itunes:episode" => set_once(&mut item.episode, value),
            b"itunes:keywords" => set_once(&mut item.keywords, value),
            _ => {}
        },
        None => match name {
            b"itunes:explicit" => set_once(&mut channel.explicit, value),
            b"itunes:type" => set_once(&mut channel.podcast_type, value),
            b"itunes:complete" => set_once(&mut channel.complete, value),
            b"itunes:new-feed-url" => set_once(&mut channel.new_feed_url, value),
            b"itunes:keywords" => set_once(&mut channel.keywords, value),
            b"itunes:author" => set_once(&mut channel.author, value),
            b"itunes:name" if parent == Some(b"itunes:owner".as_slice()) => {
                set_once(&mut channel.owner_name, value)
            }
            b"podcast:funding" => set_once(&mut channel.funding_text, value),
            _ => {}
        },
    }
}

/// Scan `bytes` for extension elements.
///
/// Fails only when the document is not well-formed XML.
pub fn scan(bytes: &[u8]) -> Result<Extensions, quick_xml::Error> {
    // SEC-002: quick-xml never expands DOCTYPE entities; unknown entities in
    // text fall back to the raw bytes instead of failing the whole feed.
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut result = Extensions::default();
    let mut current: Option<ItemExtensions> = None;
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if current.is_none() && is_item(e.local_name().as_ref()) {
                    current = Some(ItemExtensions::default());
                }
                on_element(&e, reader.decoder(), current.as_mut(), &mut result.channel);
                stack.push(e.name().as_ref().to_vec());
                text.clear();
            }
            Event::Empty(e) => {
                on_element(&e, reader.decoder(), current.as_mut(), &mut result.channel);
            }
            Event::Text(t) => match t.unescape() {
                Ok(unescaped) => text.push_str(&unescaped),
                Err(_) => text.push_str(&String::from_utf8_lossy(&t)),
            },
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::End(e) => {
                let name = e.name();
                let parent = stack
                    .len()
                    .checked_sub(2)
                    .and_then(|i| stack.get(i))
                    .map(Vec::as_slice);
                let value = std::mem::take(&mut text).trim().to_string();
                on_text(
                    name.as_ref(),
                    parent,
                    value,
                    current.as_mut(),
                    &mut result.channel,
                );

                if is_item(e.local_name().as_ref()) {
                    if let Some(item) = current.take() {
                        result.items.push(item);
                    }
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(result)
}
