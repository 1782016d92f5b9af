//! Content rendering as a composable processor chain.
//!
//! Each [`Processor`] transforms a content string given the call's template
//! data; a [`ProcessorStack`] applies them strictly in sequence, feeding the
//! output of one step into the next.

use std::collections::BTreeMap;

mod markdown;
mod slack;
mod template;

pub use markdown::MarkdownToHtml;
pub use slack::MarkdownToSlackMrkdwn;
pub use template::Template;

pub type TemplateData = BTreeMap<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("render error: {0}")]
    Render(String),
}

pub trait Processor: Send + Sync {
    fn process(&self, content: &str, data: &TemplateData) -> Result<String, ProcessError>;
}

pub struct ProcessorStack(Vec<Box<dyn Processor>>);

impl ProcessorStack {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self(processors)
    }

    /// The stack used for a destination's subject line.
    pub fn for_subject() -> Self {
        Self::new(vec![Box::new(Template::new())])
    }

    /// The content stack for a destination type; unknown types fall back to
    /// plain templating.
    pub fn for_content(destination_kind: &str) -> Self {
        match destination_kind {
            "slack" => Self::new(vec![
                Box::new(Template::new()),
                Box::new(MarkdownToSlackMrkdwn::new()),
            ]),
            "email" => Self::new(vec![
                Box::new(Template::new()),
                Box::new(MarkdownToHtml::new()),
            ]),
            _ => Self::new(vec![Box::new(Template::new())]),
        }
    }

    pub fn process(&self, content: &str, data: &TemplateData) -> Result<String, ProcessError> {
        let mut content = content.to_string();
        for processor in &self.0 {
            content = processor.process(&content, data)?;
        }
        Ok(content)
    }
}
