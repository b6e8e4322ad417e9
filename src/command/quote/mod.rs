//! Round-trip between an argv and its shell-safe one-line rendering.
//!
//! The rendering is what operators see in approval prompts and audit logs,
//! so it must be total (every argv renders) and injective (two different
//! argvs never render the same). Tokens made only of plain characters are
//! emitted verbatim; anything else is wrapped in double quotes with `"` and
//! `\` backslash-escaped.

use anyhow::{Result, bail};

/// Characters that force a token into quoted form.
fn needs_quoting(c: char) -> bool {
    matches!(
        c,
        ' ' | '\t'
            | '\n'
            | '\r'
            | '"'
            | '\''
            | '\\'
            | '$'
            | '`'
            | '&'
            | '|'
            | ';'
            | '<'
            | '>'
            | '('
            | ')'
            | '*'
            | '?'
            | '['
            | ']'
            | '{'
            | '}'
            | '#'
            | '~'
            | '!'
    )
}

fn quote_token(token: &str) -> String {
    if !token.is_empty() && !token.chars().any(needs_quoting) {
        return token.to_string();
    }
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for c in token.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Render an argv as a single shell-safe line. Tokens join with one space.
pub fn format_argv<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|t| quote_token(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a one-line rendering back into an argv.
///
/// Honors single quotes (literal), double quotes (backslash escapes `"`,
/// `\`, `$`, `` ` `` only), and backslash escapes outside quotes. Operators
/// are not special here; this is the inverse of [`format_argv`], used only
/// on strings that are argv renderings or shell-wrapped content.
pub fn parse_argv(input: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut token = String::new();
    let mut has_token = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                if has_token {
                    argv.push(std::mem::take(&mut token));
                    has_token = false;
                }
            }
            '\'' => {
                has_token = true;
                let mut closed = false;
                for q in chars.by_ref() {
                    if q == '\'' {
                        closed = true;
                        break;
                    }
                    token.push(q);
                }
                if !closed {
                    bail!("unterminated single quote");
                }
            }
            '"' => {
                has_token = true;
                let mut closed = false;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.peek().copied() {
                            Some(n @ ('"' | '\\' | '$' | '`')) => {
                                token.push(n);
                                chars.next();
                            }
                            _ => token.push('\\'),
                        },
                        _ => token.push(q),
                    }
                }
                if !closed {
                    bail!("unterminated double quote");
                }
            }
            '\\' => {
                has_token = true;
                match chars.next() {
                    Some(n) => token.push(n),
                    None => bail!("trailing backslash"),
                }
            }
            _ => {
                has_token = true;
                token.push(c);
            }
        }
    }
    if has_token {
        argv.push(token);
    }
    Ok(argv)
}
