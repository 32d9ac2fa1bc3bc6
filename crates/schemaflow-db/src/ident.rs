/// Quote an identifier for interpolation into SQL text.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub use schemaflow_common::is_identifier;

/// Column type names such as `INTEGER`, `TEXT` or `varchar(50)`.
pub fn is_type_name(s: &str) -> bool {
    !s.trim().is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ','))
}
