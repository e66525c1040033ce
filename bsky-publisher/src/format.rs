//! Turns a local post into the record that gets written to the repository.
//!
//! Posts are authored as HTML. Long-form entries are converted to Markdown;
//! short posts use plain text truncated to fit a feed post, with link facets.

use std::sync::Arc;

use chrono::Utc;
use lexicons::LexiconRecord;
use lexicons::app_bsky::feed::post::{self as feed_post, grapheme_len, truncate_graphemes};
use lexicons::app_bsky::richtext::facet::Facet;
use lexicons::com_whtwnd::blog::entry::{self as blog_entry, Entry};
use serde_json::Value;
use url::Url;

use crate::config::PublishFormat;
use crate::error::Result;
use crate::post::Post;

/// Visible length of a short post, below the lexicon maximum
pub const FEED_POST_LIMIT: usize = 280;

/// Shortest body worth keeping after a title prefix
const MIN_BODY_AFTER_TITLE: usize = 50;

const ELLIPSIS: &str = "...";

/// Converts stored HTML bodies
pub trait HtmlConverter: Send + Sync {
    fn to_markdown(&self, html: &str) -> String;
    fn to_plain_text(&self, html: &str) -> String;
}

/// Tag-level converter covering the markup the editor produces.
///
/// It scans tags one at a time and does not handle nested lists, tables or
/// unusual markup. A full HTML converter can be plugged in through
/// [`HtmlConverter`] and `PublishingServiceBuilder::html_converter`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicHtmlConverter;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Markdown,
    Plain,
}

impl HtmlConverter for BasicHtmlConverter {
    fn to_markdown(&self, html: &str) -> String {
        convert(html, Mode::Markdown)
    }

    fn to_plain_text(&self, html: &str) -> String {
        convert(html, Mode::Plain)
    }
}

fn convert(html: &str, mode: Mode) -> String {
    let markdown = mode == Mode::Markdown;
    let mut out = String::with_capacity(html.len());
    let mut links: Vec<Option<String>> = Vec::new();
    let mut in_pre = false;
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        push_text(&mut out, &rest[..start], in_pre);
        let Some(len) = rest[start..].find('>') else {
            push_text(&mut out, &rest[start..], in_pre);
            rest = "";
            break;
        };
        let tag = &rest[start + 1..start + len];
        rest = &rest[start + len + 1..];

        let closing = tag.starts_with('/');
        let body = tag.trim_start_matches('/').trim_end_matches('/');
        let name = body
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match (name.as_str(), closing) {
            ("p" | "div" | "ul" | "ol", _) => out.push_str("\n\n"),
            ("br", _) => out.push('\n'),
            ("li", false) => out.push_str(if markdown { "\n- " } else { "\n" }),
            ("blockquote", false) => out.push_str(if markdown { "\n\n> " } else { "\n\n" }),
            ("blockquote", true) => out.push_str("\n\n"),
            ("pre", closing) => {
                in_pre = !closing;
                if markdown {
                    out.push_str(if closing { "\n```\n\n" } else { "\n\n```\n" });
                } else {
                    out.push_str("\n\n");
                }
            }
            (h, false) if is_heading(h) => {
                out.push_str("\n\n");
                if markdown {
                    let level = h[1..].parse::<usize>().unwrap_or(1);
                    out.push_str(&"#".repeat(level));
                    out.push(' ');
                }
            }
            (h, true) if is_heading(h) => out.push_str("\n\n"),
            ("strong" | "b", _) if markdown => out.push_str("**"),
            ("em" | "i", _) if markdown => out.push('*'),
            ("code", _) if markdown && !in_pre => out.push('`'),
            ("a", false) => {
                let href = attribute(body, "href");
                if markdown && href.is_some() {
                    out.push('[');
                }
                links.push(href);
            }
            ("a", true) => {
                if let Some(Some(href)) = links.pop() {
                    if markdown {
                        out.push_str("](");
                        out.push_str(&href);
                        out.push(')');
                    }
                }
            }
            _ => {}
        }
    }
    push_text(&mut out, rest, in_pre);

    normalize_blank_lines(&out)
}

fn is_heading(name: &str) -> bool {
    name.len() == 2 && name.starts_with('h') && matches!(name.as_bytes()[1], b'1'..=b'6')
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let needle = format!("{}=", name);
    // Must start a new attribute, so `data-href=` is not `href=`
    let (start, _) = lower
        .match_indices(&needle)
        .find(|(i, _)| lower[..*i].ends_with(|c: char| c.is_whitespace()))?;
    let at = start + needle.len();
    let value = &tag[at..];
    let value = match value.chars().next()? {
        quote @ ('"' | '\'') => value[1..].split(quote).next()?,
        _ => value.split(|c: char| c.is_whitespace()).next()?,
    };
    Some(decode_entities(value))
}

fn push_text(out: &mut String, text: &str, preformatted: bool) {
    let decoded = decode_entities(text);
    if preformatted {
        out.push_str(&decoded);
        return;
    }
    // Source whitespace is insignificant outside <pre>
    let mut last_space = out.ends_with(|c: char| c.is_whitespace());
    for c in decoded.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn normalize_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for line in text.split('\n') {
        let line = line.trim_end();
        if line.trim().is_empty() {
            newlines += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if newlines > 0 { "\n\n" } else { "\n" });
        }
        out.push_str(line.trim_start_matches(' '));
        newlines = 0;
    }
    out
}

/// A record ready for `createRecord`
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedRecord {
    pub collection: &'static str,
    pub record: Value,
}

/// Builds the repository record for a post
pub trait ContentFormatter: Send + Sync {
    fn collection(&self) -> &'static str;

    fn format(&self, post: &Post, post_url: &Url) -> Result<FormattedRecord>;
}

/// Long-form Whitewind entry with a link back to the canonical post
pub struct BlogEntryFormatter {
    converter: Arc<dyn HtmlConverter>,
}

impl BlogEntryFormatter {
    pub fn new(converter: Arc<dyn HtmlConverter>) -> Self {
        Self { converter }
    }
}

impl ContentFormatter for BlogEntryFormatter {
    fn collection(&self) -> &'static str {
        blog_entry::NSID
    }

    fn format(&self, post: &Post, post_url: &Url) -> Result<FormattedRecord> {
        let mut content = self.converter.to_markdown(&post.content);
        content.push_str(&format!(
            "\n\n---\n*Originally published at: {}*",
            post_url
        ));

        let entry = Entry::new(Some(post.title.clone()), content, Utc::now());
        Ok(FormattedRecord {
            collection: blog_entry::NSID,
            record: entry.to_record_json()?,
        })
    }
}

/// Short Bluesky post: title and as much body as fits, links as facets
pub struct FeedPostFormatter {
    converter: Arc<dyn HtmlConverter>,
}

impl FeedPostFormatter {
    pub fn new(converter: Arc<dyn HtmlConverter>) -> Self {
        Self { converter }
    }

    pub fn compose_text(&self, title: &str, html: &str) -> String {
        let body = self.converter.to_plain_text(html);
        let prefix = if title.trim().is_empty() {
            String::new()
        } else {
            format!("{}\n\n", title.trim())
        };

        let text = if grapheme_len(&body) > FEED_POST_LIMIT {
            let available = FEED_POST_LIMIT
                .saturating_sub(grapheme_len(&prefix))
                .saturating_sub(ELLIPSIS.len());
            if available > MIN_BODY_AFTER_TITLE {
                format!(
                    "{}{}{}",
                    prefix,
                    truncate_graphemes(&body, available).trim_end(),
                    ELLIPSIS
                )
            } else {
                truncate_graphemes(&body, FEED_POST_LIMIT).to_string()
            }
        } else {
            format!("{}{}", prefix, body)
        };

        if grapheme_len(&text) > FEED_POST_LIMIT {
            let keep = FEED_POST_LIMIT - ELLIPSIS.len();
            format!("{}{}", truncate_graphemes(&text, keep).trim_end(), ELLIPSIS)
        } else {
            text
        }
    }
}

/// Link facets for every `http(s)://` run in `text`, as byte offsets
pub fn link_facets(text: &str) -> Vec<Facet> {
    let mut facets = Vec::new();
    let mut offset = 0;

    while let Some(found) = text[offset..].find("http") {
        let start = offset + found;
        let tail = &text[start..];
        if !(tail.starts_with("https://") || tail.starts_with("http://")) {
            offset = start + "http".len();
            continue;
        }

        let run = tail
            .find(|c: char| c.is_whitespace())
            .map_or(tail, |end| &tail[..end]);
        let url = run.trim_end_matches(['.', ',', ';', ':', '!', '?', ')', '"', '\'']);
        let end = start + url.len();

        if Url::parse(url).is_ok() {
            facets.push(Facet::link(start, end, url));
        }
        offset = start + run.len().max(1);
    }

    facets
}

impl ContentFormatter for FeedPostFormatter {
    fn collection(&self) -> &'static str {
        feed_post::NSID
    }

    fn format(&self, post: &Post, _post_url: &Url) -> Result<FormattedRecord> {
        let text = self.compose_text(&post.title, &post.content);
        let facets = link_facets(&text);
        let record = feed_post::Post::new(text, facets, Utc::now());
        Ok(FormattedRecord {
            collection: feed_post::NSID,
            record: record.to_record_json()?,
        })
    }
}

pub fn formatter_for(
    format: PublishFormat,
    converter: Arc<dyn HtmlConverter>,
) -> Arc<dyn ContentFormatter> {
    match format {
        PublishFormat::BlogEntry => Arc::new(BlogEntryFormatter::new(converter)),
        PublishFormat::FeedPost => Arc::new(FeedPostFormatter::new(converter)),
    }
}

/// Plain preview of a Markdown body, cut at a word boundary
pub fn preview(markdown: &str, max_chars: usize) -> String {
    let text: String = markdown
        .chars()
        .filter(|c| !matches!(c, '#' | '*' | '_' | '`' | '[' | ']' | '(' | ')' | '>' | '-'))
        .collect();
    let text = text.trim();

    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    let words: Vec<&str> = cut.split(' ').collect();
    let kept = if words.len() > 1 {
        words[..words.len() - 1].join(" ")
    } else {
        cut.clone()
    };
    format!("{}{}", kept.trim_end(), ELLIPSIS)
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
