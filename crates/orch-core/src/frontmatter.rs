//! Split and rewrite the `---`-delimited YAML frontmatter block that heads
//! every unit plan and task file.
//!
//! The body after the closing fence is never parsed — only stored and
//! written back byte-for-byte — since agents and humans author arbitrary
//! markdown there and the engine must not perturb it.

use serde_yaml::Value;

#[derive(Debug, thiserror::Error)]
pub enum FrontmatterError {
    #[error("file does not start with a `---` frontmatter fence")]
    MissingOpenFence,
    #[error("frontmatter block has no closing `---` fence")]
    MissingCloseFence,
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A parsed document: the frontmatter as a YAML mapping plus the preserved body.
#[derive(Debug, Clone)]
pub struct Frontmatter {
    pub fields: Value,
    pub body: String,
}

/// Parse a file's leading `---` fenced YAML block and the body after it.
pub fn parse(text: &str) -> Result<Frontmatter, FrontmatterError> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
        .ok_or(FrontmatterError::MissingOpenFence)?;

    let close = find_close_fence(rest).ok_or(FrontmatterError::MissingCloseFence)?;
    let (yaml_block, after) = rest.split_at(close);
    // Skip past the fence line itself (`---` plus its newline).
    let body = after
        .splitn(2, '\n')
        .nth(1)
        .unwrap_or("")
        .to_string();

    let fields: Value = serde_yaml::from_str(yaml_block)?;
    Ok(Frontmatter { fields, body })
}

/// Re-serialize `fields` as a `---` fenced block followed by `body` unchanged.
pub fn render(fm: &Frontmatter) -> Result<String, FrontmatterError> {
    let yaml = serde_yaml::to_string(&fm.fields)?;
    Ok(format!("---\n{yaml}---\n{}", fm.body))
}

/// Locate the start index of the line containing the closing `---` fence.
fn find_close_fence(rest: &str) -> Option<usize> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

/// Read a string field out of a parsed frontmatter mapping.
pub fn field_str<'a>(fields: &'a Value, key: &str) -> Option<&'a str> {
    fields.get(key)?.as_str()
}

/// Read a string list field (e.g. `depends_on`) out of a parsed frontmatter mapping.
pub fn field_str_list(fields: &Value, key: &str) -> Vec<String> {
    fields
        .get(key)
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Read an integer list field (e.g. task-level `depends_on`).
pub fn field_int_list(fields: &Value, key: &str) -> Vec<i64> {
    fields
        .get(key)
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip_preserves_body() {
        let text = "---\nunit: foo\ndepends_on: [bar, baz]\n---\n# Plan\n\nbody text here\n";
        let fm = parse(text).expect("parse");
        assert_eq!(field_str(&fm.fields, "unit"), Some("foo"));
        assert_eq!(field_str_list(&fm.fields, "depends_on"), vec!["bar", "baz"]);
        assert_eq!(fm.body, "# Plan\n\nbody text here\n");

        let rendered = render(&fm).expect("render");
        let reparsed = parse(&rendered).expect("reparse");
        assert_eq!(reparsed.body, fm.body);
        assert_eq!(field_str(&reparsed.fields, "unit"), Some("foo"));
    }

    #[test]
    fn missing_open_fence_errors() {
        let err = parse("no frontmatter here\n").unwrap_err();
        assert!(matches!(err, FrontmatterError::MissingOpenFence));
    }

    #[test]
    fn missing_close_fence_errors() {
        let err = parse("---\nunit: foo\n").unwrap_err();
        assert!(matches!(err, FrontmatterError::MissingCloseFence));
    }

    #[test]
    fn task_int_depends_on_parses() {
        let text = "---\ntask: 2\nstatus: pending\nbackpressure: \"true\"\ndepends_on: [1]\n---\nbody\n";
        let fm = parse(text).expect("parse");
        assert_eq!(field_int_list(&fm.fields, "depends_on"), vec![1]);
    }
}
