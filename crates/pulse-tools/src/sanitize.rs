//! Shell-safe substitution of container names into command templates

/// Tokens replaced by the quoted container name
pub const CONTAINER_TOKENS: [&str; 2] = ["${container}", "{container}"];

/// Quote a name for a POSIX shell unless it is made only of `[A-Za-z0-9._-]`
pub fn shell_quote(name: &str) -> String {
    let safe = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if safe {
        return name.to_string();
    }
    format!("'{}'", name.replace('\'', r"'\''"))
}

/// Replace both container tokens in `template` with the quoted name
pub fn substitute_container(template: &str, container: &str) -> String {
    let quoted = shell_quote(container);
    CONTAINER_TOKENS
        .iter()
        .fold(template.to_string(), |acc, token| acc.replace(token, &quoted))
}
