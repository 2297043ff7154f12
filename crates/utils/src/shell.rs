//! POSIX shell quoting for the rendered container command.
//!
//! The agent prompt is user-controlled free text and must survive a trip
//! through a rendered command line unchanged. `quote` produces a double-quoted
//! form, `split` tokenizes it back; the pair is lossless for any input.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShellSplitError {
    #[error("unterminated quote in command line")]
    UnterminatedQuote,
    #[error("trailing backslash in command line")]
    TrailingBackslash,
}

/// Characters that are safe to leave unquoted in a rendered command line.
fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
}

/// Double-quote `arg` unconditionally, escaping the characters the shell
/// interprets inside double quotes (`\`, `"`, `$`, backtick). Newlines are
/// legal inside double quotes and pass through literally.
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote `arg` only when it contains characters a shell would interpret.
pub fn quote_if_needed(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_plain) {
        arg.to_string()
    } else {
        quote(arg)
    }
}

/// Join arguments into a single command line, quoting where required.
pub fn join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote_if_needed(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a command line into arguments, honoring single quotes, double quotes
/// (with `\`-escapes for `\`, `"`, `$`, backtick), and unquoted backslash
/// escapes. The inverse of [`join`]/[`quote`].
pub fn split(line: &str) -> Result<Vec<String>, ShellSplitError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(ShellSplitError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('\\' | '"' | '$' | '`')) => current.push(e),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(ShellSplitError::UnterminatedQuote),
                        },
                        Some(c) => current.push(c),
                        None => return Err(ShellSplitError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(ShellSplitError::TrailingBackslash),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        args.push(current);
    }
    Ok(args)
}
