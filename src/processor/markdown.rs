//! Markdown to HTML conversion.

use kuchiki::traits::*;
use kuchiki::NodeRef;
use pulldown_cmark::{html, Options, Parser};

use super::{ProcessError, Processor, TemplateData};

/// Converts CommonMark to HTML. Headings receive stable ids derived from
/// their text, and links open in a new tab.
pub struct MarkdownToHtml;

impl MarkdownToHtml {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MarkdownToHtml {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) fn render_html(content: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_FOOTNOTES);
    let parser = Parser::new_ext(content, options);

    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

fn heading_slug(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_dash = false;
    for ch in text.trim().chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn add_heading_ids(document: &NodeRef) {
    if let Ok(headings) = document.select("h1, h2, h3, h4, h5, h6") {
        for heading in headings {
            let mut attributes = heading.attributes.borrow_mut();
            if attributes.get("id").is_some() {
                continue;
            }
            let slug = heading_slug(&heading.as_node().text_contents());
            if !slug.is_empty() {
                attributes.insert("id", slug);
            }
        }
    }
}

fn open_links_in_new_tab(document: &NodeRef) {
    if let Ok(links) = document.select("a[href]") {
        for link in links {
            link.attributes
                .borrow_mut()
                .insert("target", "_blank".to_string());
        }
    }
}

fn body_html(document: &NodeRef) -> String {
    if let Ok(mut bodies) = document.select("body") {
        if let Some(body) = bodies.next() {
            let mut out = String::new();
            for child in body.as_node().children() {
                out.push_str(&child.to_string());
            }
            return out;
        }
    }
    document.to_string()
}

impl Processor for MarkdownToHtml {
    fn process(&self, content: &str, _data: &TemplateData) -> Result<String, ProcessError> {
        let document = kuchiki::parse_html().one(render_html(content));
        add_heading_ids(&document);
        open_links_in_new_tab(&document);
        Ok(body_html(&document))
    }
}
