//! Message templates with named placeholders.
//!
//! A template such as `"User {Name} paid {Amount:F2}"` is bound to
//! positional arguments by [`parse`], which yields ordered `(name, value)`
//! pairs, and rendered back to text by [`interpolate`]. `{{` and `}}` escape
//! literal braces. Malformed input never errors: anything that is not a
//! well-formed placeholder is kept as literal text.

use crate::value::LogValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Text(&'a str),
    /// An escaped `{{` or `}}`.
    Brace(char),
    Hole {
        raw: &'a str,
        name: &'a str,
        spec: Option<&'a str>,
    },
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }
}

fn is_brace(c: char) -> bool {
    c == '{' || c == '}'
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let rest = &self.src[self.pos..];
        let bytes = rest.as_bytes();
        match bytes.first()? {
            b'{' => {
                if bytes.get(1) == Some(&b'{') {
                    self.pos += 2;
                    return Some(Token::Brace('{'));
                }
                // The key runs to the next brace; only a `}` closes it.
                match rest[1..].find(is_brace) {
                    Some(len) if bytes[1 + len] == b'}' => {
                        let raw = &rest[1..1 + len];
                        let (name, spec) = match raw.split_once(':') {
                            Some((name, spec)) => (name, Some(spec)),
                            None => (raw, None),
                        };
                        let consumed = len + 2;
                        self.pos += consumed;
                        if name.is_empty() {
                            Some(Token::Text(&rest[..consumed]))
                        } else {
                            Some(Token::Hole { raw, name, spec })
                        }
                    }
                    _ => {
                        self.pos += 1;
                        Some(Token::Text(&rest[..1]))
                    }
                }
            }
            b'}' => {
                if bytes.get(1) == Some(&b'}') {
                    self.pos += 2;
                    Some(Token::Brace('}'))
                } else {
                    self.pos += 1;
                    Some(Token::Text(&rest[..1]))
                }
            }
            _ => {
                let end = rest.find(is_brace).unwrap_or(rest.len());
                self.pos += end;
                Some(Token::Text(&rest[..end]))
            }
        }
    }
}

/// Bind positional `args` to the placeholder names of `template`.
///
/// Names are bound in order of first appearance. A name seen earlier keeps
/// its first value and does not consume an argument. Once the arguments run
/// out the remaining placeholders stay unbound; surplus arguments are
/// dropped.
pub fn parse<I>(template: &str, args: I) -> Vec<(String, LogValue)>
where
    I: IntoIterator<Item = LogValue>,
{
    let mut args = args.into_iter().peekable();
    let mut pairs: Vec<(String, LogValue)> = Vec::new();
    if args.peek().is_none() {
        return pairs;
    }
    for token in Scanner::new(template) {
        let Token::Hole { name, .. } = token else {
            continue;
        };
        if pairs.iter().any(|(seen, _)| seen == name) {
            continue;
        }
        match args.next() {
            Some(value) => pairs.push((name.to_string(), value)),
            None => break,
        }
    }
    pairs
}

/// Render `template` with bound `pairs`.
///
/// Unknown names are emitted verbatim, braces and format spec included.
pub fn interpolate(template: &str, pairs: &[(String, LogValue)]) -> String {
    interpolate_with(template, pairs, |value, spec| match spec {
        Some(spec) => value.format_with(spec),
        None => value.to_string(),
    })
}

/// Like [`interpolate`], with a caller-supplied renderer for bound values.
pub fn interpolate_with<F>(template: &str, pairs: &[(String, LogValue)], mut render: F) -> String
where
    F: FnMut(&LogValue, Option<&str>) -> String,
{
    let mut out = String::with_capacity(template.len() + pairs.len() * 8);
    for token in Scanner::new(template) {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Brace(brace) => out.push(brace),
            Token::Hole { raw, name, spec } => match pairs.iter().find(|(bound, _)| bound == name) {
                Some((_, value)) => out.push_str(&render(value, spec)),
                None => {
                    out.push('{');
                    out.push_str(raw);
                    out.push('}');
                }
            },
        }
    }
    out
}
