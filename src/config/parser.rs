use std::collections::HashMap;

/// A strict parser for the flat `directive value;` configuration syntax.
/// Returns a descriptive error string if the configuration is malformed.
///
/// Rules enforced:
/// - Every directive must be exactly `NAME VALUE ;`
/// - Unknown directives are rejected by the caller, not silently dropped
/// - `#` starts a comment that runs to end of line
/// - Quoted values may contain whitespace (e.g. `key_prefix "a b";`)
pub fn parse_directives(input: &str) -> Result<Vec<(String, String)>, String> {
    let tokens = tokenize(input);
    let mut directives = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        if i + 2 >= tokens.len() {
            return Err(format!(
                "Directive '{}' at token position {i} is incomplete: expected 'VALUE ;'",
                tokens[i]
            ));
        }
        if tokens[i + 1] == ";" || tokens[i + 1] == "{" || tokens[i + 1] == "}" {
            return Err(format!(
                "Directive '{}' at token position {i} is missing a value",
                tokens[i]
            ));
        }
        if tokens[i + 2] != ";" {
            return Err(format!(
                "Directive '{} {}' at token position {i} is missing a semicolon ';' (found '{}')",
                tokens[i],
                tokens[i + 1],
                tokens[i + 2]
            ));
        }
        directives.push((tokens[i].clone(), tokens[i + 1].clone()));
        i += 3;
    }

    Ok(directives)
}

/// Collects directives into a map, rejecting duplicates.
pub fn parse_directive_map(input: &str) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for (name, value) in parse_directives(input)? {
        if map.insert(name.clone(), value).is_some() {
            return Err(format!("Duplicate directive '{name}'"));
        }
    }
    Ok(map)
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current_token = String::new();
    let mut in_quotes = false;
    let mut in_comment = false;

    for c in input.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }

        if c == '#' && !in_quotes {
            in_comment = true;
            if !current_token.is_empty() {
                tokens.push(current_token.clone());
                current_token.clear();
            }
            continue;
        }

        // Toggle quote state to capture strings with embedded spaces
        if c == '"' || c == '\'' {
            in_quotes = !in_quotes;
            continue;
        }

        if in_quotes {
            current_token.push(c);
            continue;
        }

        // Whitespace acts as a token delimiter
        if c.is_whitespace() {
            if !current_token.is_empty() {
                tokens.push(current_token.clone());
                current_token.clear();
            }
            continue;
        }

        // Structural characters are their own immediate tokens
        if c == '{' || c == '}' || c == ';' {
            if !current_token.is_empty() {
                tokens.push(current_token.clone());
                current_token.clear();
            }
            tokens.push(c.to_string());
            continue;
        }

        // Build up normal text tokens (e.g., words, numbers, paths)
        current_token.push(c);
    }

    if !current_token.is_empty() {
        tokens.push(current_token);
    }

    tokens
}
