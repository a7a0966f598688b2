// Command template resolution
//
// Job commands may contain `{name}` placeholders that are filled from the job's
// command args merged with per-start overrides. `{{` and `}}` produce literal braces.

use crate::supervisor::protocol::CommandArgs;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("failed to compile placeholder matcher")
});

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no value for placeholder '{{{0}}}'")]
pub struct MissingPlaceholder(pub String);

/// Substitute every placeholder in `template`
///
/// `overrides` take precedence over `defaults`. Fails on the first placeholder
/// that neither map provides.
pub fn resolve_command(
    template: &str,
    defaults: &CommandArgs,
    overrides: &CommandArgs,
) -> Result<String, MissingPlaceholder> {
    let mut resolved = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        resolved.push_str(&template[last..whole.start()]);
        resolved.push_str(&substitute(&caps, defaults, overrides)?);
        last = whole.end();
    }
    resolved.push_str(&template[last..]);

    Ok(resolved)
}

fn substitute(
    caps: &Captures<'_>,
    defaults: &CommandArgs,
    overrides: &CommandArgs,
) -> Result<String, MissingPlaceholder> {
    let Some(name) = caps.get(1) else {
        // `{{` or `}}`
        return Ok(caps[0][..1].to_string());
    };
    let name = name.as_str();

    overrides
        .get(name)
        .or_else(|| defaults.get(name))
        .map(format_value)
        .ok_or_else(|| MissingPlaceholder(name.to_string()))
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> CommandArgs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_plain_command_is_unchanged() {
        let empty = CommandArgs::new();
        assert_eq!(
            resolve_command("sleep 5 && echo done", &empty, &empty).unwrap(),
            "sleep 5 && echo done"
        );
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let defaults = args(json!({"host": "localhost", "port": 8080}));
        let overrides = args(json!({"port": 9000}));
        assert_eq!(
            resolve_command("serve --host {host} --port {port}", &defaults, &overrides).unwrap(),
            "serve --host localhost --port 9000"
        );
    }

    #[test]
    fn test_missing_placeholder_is_reported() {
        let defaults = args(json!({"host": "localhost"}));
        assert_eq!(
            resolve_command("ping {host} -c {count}", &defaults, &CommandArgs::new()),
            Err(MissingPlaceholder("count".to_string()))
        );
    }

    #[test]
    fn test_escaped_braces_and_shell_syntax() {
        let defaults = args(json!({"name": "world"}));
        assert_eq!(
            resolve_command("echo {{literal}} {name} { ls; }", &defaults, &CommandArgs::new())
                .unwrap(),
            "echo {literal} world { ls; }"
        );
    }

    #[test]
    fn test_shell_parameter_expansion_needs_escaping() {
        let empty = CommandArgs::new();
        assert_eq!(
            resolve_command("echo ${HOME}", &empty, &empty),
            Err(MissingPlaceholder("HOME".to_string()))
        );
        assert_eq!(
            resolve_command("echo ${{HOME}}", &empty, &empty).unwrap(),
            "echo ${HOME}"
        );
    }
}
