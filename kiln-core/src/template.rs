//! Command template expansion
//!
//! Templates reference variables as `${NAME}`. `$$` is a literal `$`, and a
//! `$` followed by anything else is kept as-is.

use crate::error::ExecutionError;

/// Variables every environment provides, whatever the target declares
pub const BUILTIN_VARS: &[&str] = &[
    "KILN_TAG",
    "KILN_SOURCE_DIR",
    "KILN_ARTIFACT_DIR",
    "KILN_OS",
    "KILN_ARCH",
    "KILN_FORMAT",
];

enum Piece<'a> {
    Text(&'a str),
    Var(&'a str),
}

fn split(template: &str) -> Result<Vec<Piece<'_>>, ExecutionError> {
    let mut pieces = Vec::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        pieces.push(Piece::Text(&rest[..pos]));
        let after = &rest[pos + 1..];
        if let Some(stripped) = after.strip_prefix('$') {
            pieces.push(Piece::Text("$"));
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or_else(|| ExecutionError::MalformedTemplate {
                template: template.to_string(),
            })?;
            pieces.push(Piece::Var(&body[..end]));
            rest = &body[end + 1..];
        } else {
            pieces.push(Piece::Text("$"));
            rest = after;
        }
    }
    pieces.push(Piece::Text(rest));

    Ok(pieces)
}

/// Lists the variable names a template references, in order of appearance
pub fn placeholders(template: &str) -> Result<Vec<String>, ExecutionError> {
    Ok(split(template)?
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Var(name) => Some(name.to_string()),
            Piece::Text(_) => None,
        })
        .collect())
}

/// Expands a template, resolving each variable through `lookup`
pub fn expand<F>(template: &str, lookup: F) -> Result<String, ExecutionError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    for piece in split(template)? {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Var(name) => {
                let value = lookup(name).ok_or_else(|| ExecutionError::UnknownVariable {
                    name: name.to_string(),
                    template: template.to_string(),
                })?;
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}
