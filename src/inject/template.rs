//! Minimal renderer for the Go-template subset used by manifests.
//!
//! Supported actions:
//! - `{{ .NAME }}` inserts the value of `NAME`
//! - `{{ index . "NAME" }}` for names that are not identifiers
//! - `{{/* comment */}}`
//! - `{{-` / `-}}` trim the whitespace before / after the action

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

static ACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}").unwrap());
static FIELD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.([A-Za-z_][A-Za-z0-9_]*)$").unwrap());
static INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^index\s+\.\s+"([^"]*)"$"#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template '{template}': unclosed action at byte {offset}")]
    Unclosed { template: String, offset: usize },
    #[error("template '{template}': empty action at byte {offset}")]
    Empty { template: String, offset: usize },
    #[error("template '{template}': unsupported action '{{{{{action}}}}}' at byte {offset}")]
    Unsupported {
        template: String,
        action: String,
        offset: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

/// A parsed template body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

/// Rendered output plus the placeholders that had no value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    pub output: String,
    pub missing: Vec<String>,
}

impl Template {
    pub fn parse(name: &str, body: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut cursor = 0;
        let mut trim_next = false;

        for caps in ACTION.captures_iter(body) {
            let Some(whole) = caps.get(0) else { continue };
            let mut text = &body[cursor..whole.start()];
            check_no_open(name, text, cursor)?;

            if trim_next {
                text = text.trim_start();
            }
            let mut action = &caps[1];
            if let Some(rest) = action.strip_prefix('-') {
                if rest.starts_with(char::is_whitespace) {
                    text = text.trim_end();
                    action = rest;
                }
            }
            trim_next = false;
            if let Some(rest) = action.strip_suffix('-') {
                if rest.ends_with(char::is_whitespace) {
                    trim_next = true;
                    action = rest;
                }
            }

            push_text(&mut segments, text);
            if let Some(field) = parse_action(name, action.trim(), whole.start())? {
                segments.push(Segment::Field(field));
            }
            cursor = whole.end();
        }

        let mut tail = &body[cursor..];
        check_no_open(name, tail, cursor)?;
        if trim_next {
            tail = tail.trim_start();
        }
        push_text(&mut segments, tail);

        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render with `values`. Unknown names render as the empty string and are
    /// listed in [`Rendered::missing`].
    pub fn render(&self, values: &BTreeMap<String, String>) -> Rendered {
        let mut rendered = Rendered::default();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => rendered.output.push_str(text),
                Segment::Field(field) => match values.get(field) {
                    Some(value) => rendered.output.push_str(value),
                    None => rendered.missing.push(field.clone()),
                },
            }
        }
        rendered
    }
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn check_no_open(template: &str, text: &str, base: usize) -> Result<(), TemplateError> {
    match text.find("{{") {
        Some(pos) => Err(TemplateError::Unclosed {
            template: template.to_string(),
            offset: base + pos,
        }),
        None => Ok(()),
    }
}

/// `Ok(None)` for comments, `Ok(Some(name))` for value lookups.
fn parse_action(
    template: &str,
    action: &str,
    offset: usize,
) -> Result<Option<String>, TemplateError> {
    if action.is_empty() {
        return Err(TemplateError::Empty {
            template: template.to_string(),
            offset,
        });
    }
    if action.starts_with("/*") && action.ends_with("*/") {
        return Ok(None);
    }
    if let Some(caps) = FIELD.captures(action) {
        return Ok(Some(caps[1].to_string()));
    }
    if let Some(caps) = INDEX.captures(action) {
        return Ok(Some(caps[1].to_string()));
    }
    Err(TemplateError::Unsupported {
        template: template.to_string(),
        action: action.to_string(),
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_fields_and_index() {
        let t = Template::parse(
            "app.conf",
            "user={{ .DB_USER }}\npass={{.DB_PASS}}\nkey={{ index . \"api-key\" }}\n",
        )
        .unwrap();
        let out = t.render(&values(&[
            ("DB_USER", "billing"),
            ("DB_PASS", "s3cr3t"),
            ("api-key", "k-1"),
        ]));
        assert_eq!(out.output, "user=billing\npass=s3cr3t\nkey=k-1\n");
        assert!(out.missing.is_empty());
    }

    #[test]
    fn missing_values_render_empty_and_are_reported() {
        let t = Template::parse("t", "a={{ .A }};b={{ .B }}").unwrap();
        let out = t.render(&values(&[("A", "1")]));
        assert_eq!(out.output, "a=1;b=");
        assert_eq!(out.missing, vec!["B".to_string()]);
    }

    #[test]
    fn comments_and_trim_markers() {
        let t = Template::parse("t", "x  {{- /* note */ -}}  y {{- .V }}").unwrap();
        assert_eq!(t.render(&values(&[("V", "!")])).output, "xy!");
    }

    #[test]
    fn hyphenated_names_are_not_trim_markers() {
        let t = Template::parse("t", "a {{-.X}}").unwrap_err();
        assert!(matches!(t, TemplateError::Unsupported { .. }));
    }

    #[test]
    fn plain_text_passes_through() {
        let t = Template::parse("t", "no actions } here {").unwrap();
        assert_eq!(t.render(&BTreeMap::new()).output, "no actions } here {");
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            Template::parse("t", "a {{ .A }} b {{ .B"),
            Err(TemplateError::Unclosed { offset: 13, .. })
        ));
        assert!(matches!(
            Template::parse("t", "{{ }}"),
            Err(TemplateError::Empty { .. })
        ));
        assert!(matches!(
            Template::parse("t", "{{ range .Items }}"),
            Err(TemplateError::Unsupported { .. })
        ));
    }

    #[test]
    fn error_message_names_template_and_action() {
        let err = Template::parse("app.conf", "{{ if .X }}").unwrap_err();
        assert_eq!(
            err.to_string(),
            "template 'app.conf': unsupported action '{{if .X}}' at byte 0"
        );
    }
}
