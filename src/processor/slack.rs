//! Markdown to Slack mrkdwn conversion.
//!
//! Slack's mrkdwn is not Markdown: the content is first rendered to HTML
//! and the tree is then walked, mapping each element onto its mrkdwn
//! equivalent.

use kuchiki::traits::*;
use kuchiki::NodeRef;

use super::markdown::render_html;
use super::{ProcessError, Processor, TemplateData};

pub struct MarkdownToSlackMrkdwn;

impl MarkdownToSlackMrkdwn {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MarkdownToSlackMrkdwn {
    fn default() -> Self {
        Self::new()
    }
}

fn walk(node: &NodeRef, out: &mut String) {
    if let Some(text) = node.as_text() {
        out.push_str(&text.borrow());
    }

    let tag = node
        .as_element()
        .map(|element| element.name.local.as_ref().to_string());

    if let Some(tag) = tag.as_deref() {
        match tag {
            "p" => out.push('\n'),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => out.push('*'),
            "a" => {
                let href = node
                    .as_element()
                    .and_then(|element| {
                        element.attributes.borrow().get("href").map(str::to_string)
                    })
                    .unwrap_or_default();
                out.push('<');
                out.push_str(&href);
                out.push('|');
            }
            "li" => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("\u{2022} ");
            }
            "strong" | "b" => out.push('*'),
            "em" | "i" => out.push('_'),
            _ => {}
        }
    }

    for child in node.children() {
        walk(&child, out);
    }

    if let Some(tag) = tag.as_deref() {
        match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => out.push('*'),
            "a" => out.push('>'),
            "strong" | "b" => out.push('*'),
            "em" | "i" => out.push('_'),
            _ => {}
        }
    }
}

pub fn html_to_mrkdwn(html: &str) -> String {
    let document = kuchiki::parse_html().one(html);
    let mut out = String::new();
    walk(&document, &mut out);
    out.trim().to_string()
}

impl Processor for MarkdownToSlackMrkdwn {
    fn process(&self, content: &str, _data: &TemplateData) -> Result<String, ProcessError> {
        Ok(html_to_mrkdwn(&render_html(content)))
    }
}
