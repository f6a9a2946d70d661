//! SQL identifier and literal quoting
//!
//! Table and column names come straight from subjects and payload keys,
//! so every name is quoted before it reaches a statement.

/// Quote an identifier for use in SQL
///
/// Embedded double quotes are doubled. NUL bytes cannot be expressed and
/// are dropped; the materializer rejects such names before they get here.
pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for ch in name.chars() {
        match ch {
            '"' => out.push_str("\"\""),
            '\0' => {}
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Quote a string literal for use in SQL
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\0' => {}
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
