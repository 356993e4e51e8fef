//! `${VAR}` interpolation applied to the raw YAML text before parsing.
//!
//! Accepted forms: `$VAR`, `${VAR}`, `${VAR:-fallback}` (fallback when unset or
//! empty), `${VAR-fallback}` (fallback only when unset) and `$$` for a literal `$`.

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("reference pattern is valid")
});

/// How a reference falls back when its variable is missing.
enum Fallback<'a> {
    None,
    WhenUnset(&'a str),
    WhenUnsetOrEmpty(&'a str),
}

fn resolve(caps: &Captures<'_>) -> Result<String, String> {
    let Some(name) = caps.get(1).or_else(|| caps.get(4)).map(|m| m.as_str()) else {
        return Ok("$".to_string());
    };

    let fallback = match (caps.get(2).map(|m| m.as_str()), caps.get(3)) {
        (Some(":-"), Some(value)) => Fallback::WhenUnsetOrEmpty(value.as_str()),
        (Some(_), Some(value)) => Fallback::WhenUnset(value.as_str()),
        _ => Fallback::None,
    };

    match (env::var(name), fallback) {
        (Ok(value), _) if value.contains(['\n', '\r']) => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        (Ok(value), Fallback::WhenUnsetOrEmpty(default)) if value.is_empty() => {
            Ok(default.to_string())
        }
        (Ok(value), _) => Ok(value),
        (Err(_), Fallback::WhenUnset(default) | Fallback::WhenUnsetOrEmpty(default)) => {
            Ok(default.to_string())
        }
        (Err(_), Fallback::None) => Err(format!("environment variable '{name}' is not set")),
    }
}

/// Substitute environment references in `input`.
///
/// Every unresolved reference is collected so one run reports all of them.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut problems = Vec::new();
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for caps in REFERENCE.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        output.push_str(&input[last..whole.start()]);
        match resolve(&caps) {
            Ok(value) => output.push_str(&value),
            Err(problem) => {
                problems.push(problem);
                output.push_str(whole.as_str());
            }
        }
        last = whole.end();
    }
    output.push_str(&input[last..]);

    if problems.is_empty() {
        Ok(output)
    } else {
        Err(problems)
    }
}
