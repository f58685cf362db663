use std::io::Cursor;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Deserialize;

use super::facet::ArchiveLayout;
use super::item::Item;
use super::page::FacetDir;
use crate::util::write_atomic;

/// Fixed channel metadata of the syndication document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub title: String,
    pub link: String,
    pub description: String,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            title: "Feed Archive".to_string(),
            link: String::new(),
            description: "Latest posts from every subscribed feed".to_string(),
        }
    }
}

/// Renders items as an RSS 2.0 document.
///
/// Items without a title, link, author or representable timestamp are left
/// out. Each item carries `title`, `link`, `author`, a permalink `guid` and an
/// RFC 2822 `pubDate`.
pub fn render_feed(items: &[Item], channel: &Channel) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(rss))
        .context("Failed to write rss element")?;
    writer
        .write_event(Event::Start(BytesStart::new("channel")))
        .context("Failed to write channel element")?;

    text_element(&mut writer, "title", &channel.title)?;
    text_element(&mut writer, "link", &channel.link)?;
    text_element(&mut writer, "description", &channel.description)?;

    for (item, published) in syndicated(items) {
        writer
            .write_event(Event::Start(BytesStart::new("item")))
            .context("Failed to write item element")?;
        text_element(&mut writer, "title", &item.title)?;
        text_element(&mut writer, "link", &item.link)?;
        text_element(&mut writer, "author", &item.author)?;

        let mut guid = BytesStart::new("guid");
        guid.push_attribute(("isPermaLink", "true"));
        writer
            .write_event(Event::Start(guid))
            .context("Failed to write guid element")?;
        writer
            .write_event(Event::Text(BytesText::new(&item.link)))
            .context("Failed to write guid text")?;
        writer
            .write_event(Event::End(BytesEnd::new("guid")))
            .context("Failed to write guid end")?;

        text_element(&mut writer, "pubDate", &published.to_rfc2822())?;
        writer
            .write_event(Event::End(BytesEnd::new("item")))
            .context("Failed to write item end")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("channel")))
        .context("Failed to write channel end")?;
    writer
        .write_event(Event::End(BytesEnd::new("rss")))
        .context("Failed to write rss end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated RSS contains invalid UTF-8")
}

/// Items eligible for the feed, paired with their publication time.
fn syndicated(items: &[Item]) -> impl Iterator<Item = (&Item, DateTime<Utc>)> {
    items.iter().filter_map(|item| {
        if item.title.is_empty() || item.link.is_empty() || item.author.is_empty() {
            return None;
        }
        DateTime::from_timestamp(item.timestamp, 0).map(|published| (item, published))
    })
}

fn text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .with_context(|| format!("Failed to write {name} element"))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .with_context(|| format!("Failed to write {name} text"))?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write {name} end"))?;
    Ok(())
}

/// Renders page 1 of the global `all` facet to `all/rss.xml`, atomically.
///
/// Returns the number of items in the document. A missing page 1 yields an
/// empty channel.
pub fn emit_feed(layout: &ArchiveLayout, channel: &Channel) -> Result<usize> {
    let all = layout.global().all();
    let facet = FacetDir::new(&all);
    let items = if facet.page_path(1).is_file() {
        facet.read_page(1).items
    } else {
        tracing::debug!(facet = %all.display(), "No first page, emitting empty feed");
        Vec::new()
    };

    let document = render_feed(&items, channel)?;
    let count = syndicated(&items).count();

    let path = layout.feed_file();
    std::fs::create_dir_all(&all)
        .with_context(|| format!("Failed to create {}", all.display()))?;
    write_atomic(&path, document.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    tracing::info!(file = %path.display(), items = count, "Syndication feed written");
    Ok(count)
}
