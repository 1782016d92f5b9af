//! Template evaluation over the call's `data` mapping.

use chrono::DateTime;
use minijinja::Environment;

use super::{ProcessError, Processor, TemplateData};

/// Renders the content as a template. The call's `data` keys are available
/// as variables, along with `ScheduledAt` (RFC 3339). Helper filters cover
/// the common string/date needs beyond minijinja's built-ins.
pub struct Template {
    env: Environment<'static>,
}

impl Template {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_filter("date", date);
        Self { env }
    }
}

impl Default for Template {
    fn default() -> Self {
        Self::new()
    }
}

/// Format an RFC 3339 timestamp with a strftime pattern.
fn date(value: String, format: String) -> Result<String, minijinja::Error> {
    let parsed = DateTime::parse_from_rfc3339(&value).map_err(|err| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("not an RFC 3339 timestamp: {err}"),
        )
    })?;
    Ok(parsed.format(&format).to_string())
}

impl Processor for Template {
    fn process(&self, content: &str, data: &TemplateData) -> Result<String, ProcessError> {
        let context = minijinja::Value::from_serialize(data);
        Ok(self.env.render_str(content, context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, serde_json::Value)]) -> TemplateData {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn renders_data_variables() {
        let template = Template::new();
        let out = template
            .process(
                "Hello {{ name }}, {{ count }} seats left",
                &data(&[
                    ("name", serde_json::json!("Ada")),
                    ("count", serde_json::json!(3)),
                ]),
            )
            .expect("render");
        assert_eq!(out, "Hello Ada, 3 seats left");
    }

    #[test]
    fn date_filter_formats_scheduled_at() {
        let template = Template::new();
        let out = template
            .process(
                "Goes out {{ ScheduledAt | date(\"%Y-%m-%d %H:%M\") }}",
                &data(&[("ScheduledAt", serde_json::json!("2023-01-01T10:00:00Z"))]),
            )
            .expect("render");
        assert_eq!(out, "Goes out 2023-01-01 10:00");
    }

    #[test]
    fn builtin_filters_are_available() {
        let template = Template::new();
        let out = template
            .process(
                "{{ name | upper }}",
                &data(&[("name", serde_json::json!("ada"))]),
            )
            .expect("render");
        assert_eq!(out, "ADA");
    }

    #[test]
    fn syntax_error_surfaces() {
        let template = Template::new();
        assert!(template
            .process("{{ unclosed", &TemplateData::new())
            .is_err());
    }
}
