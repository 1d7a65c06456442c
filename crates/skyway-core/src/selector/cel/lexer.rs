//! Tokenizer for the CEL subset.

use super::super::SelectorError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Colon,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, SelectorError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |offset: usize, msg: &str| {
        SelectorError::Compile(format!("{msg} at offset {offset}"))
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let peek = chars.get(i + 1).map(|(_, c)| *c);
        let two = |t: Token| Spanned { token: t, offset };
        let (token, width) = match (c, peek) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('.', Some(d)) if d.is_ascii_digit() => {
                return Err(err(offset, "number must start with a digit"));
            }
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            (':', _) => (Token::Colon, 1),
            ('?', _) => (Token::Question, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('!', _) => (Token::Bang, 1),
            ('<', Some('=')) => (Token::Le, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', Some('=')) => (Token::Ge, 2),
            ('>', _) => (Token::Gt, 1),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('"', _) | ('\'', _) => {
                let (s, next) = lex_string(&chars, i, false)?;
                tokens.push(two(Token::Str(s)));
                i = next;
                continue;
            }
            ('r', Some(q)) | ('R', Some(q)) if q == '"' || q == '\'' => {
                let (s, next) = lex_string(&chars, i + 1, true)?;
                tokens.push(two(Token::Str(s)));
                i = next;
                continue;
            }
            (d, _) if d.is_ascii_digit() => {
                let (token, next) = lex_number(&chars, i)?;
                tokens.push(two(token));
                i = next;
                continue;
            }
            (a, _) if a.is_ascii_alphabetic() || a == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = if word == "in" {
                    Token::In
                } else {
                    Token::Ident(word)
                };
                tokens.push(two(token));
                continue;
            }
            _ => return Err(err(offset, &format!("unexpected character {c:?}"))),
        };
        tokens.push(two(token));
        i += width;
    }
    Ok(tokens)
}

fn lex_string(
    chars: &[(usize, char)],
    start: usize,
    raw: bool,
) -> Result<(String, usize), SelectorError> {
    let (offset, quote) = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' && !raw {
            let escaped = chars.get(i + 1).map(|(_, c)| *c).ok_or_else(|| {
                SelectorError::Compile(format!("unterminated escape at offset {}", chars[i].0))
            })?;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                '\\' | '\'' | '"' => escaped,
                other => {
                    return Err(SelectorError::Compile(format!(
                        "unknown escape \\{other} at offset {}",
                        chars[i].0
                    )))
                }
            });
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }
    Err(SelectorError::Compile(format!(
        "unterminated string starting at offset {offset}"
    )))
}

fn lex_number(chars: &[(usize, char)], start: usize) -> Result<(Token, usize), SelectorError> {
    let offset = chars[start].0;
    let mut i = start;
    let mut is_double = false;
    while i < chars.len() {
        let c = chars[i].1;
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.'
            && !is_double
            && chars.get(i + 1).map_or(false, |(_, d)| d.is_ascii_digit())
        {
            is_double = true;
            i += 1;
        } else if (c == 'e' || c == 'E') && i > start {
            is_double = true;
            i += 1;
            if chars.get(i).map_or(false, |(_, s)| *s == '+' || *s == '-') {
                i += 1;
            }
        } else {
            break;
        }
    }
    let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
    let bad = |e: &dyn std::fmt::Display| {
        SelectorError::Compile(format!("invalid number {text:?} at offset {offset}: {e}"))
    };
    if is_double {
        let v: f64 = text.parse().map_err(|e| bad(&e))?;
        return Ok((Token::Double(v), i));
    }
    if chars.get(i).map_or(false, |(_, c)| *c == 'u' || *c == 'U') {
        let v: u64 = text.parse().map_err(|e| bad(&e))?;
        return Ok((Token::UInt(v), i + 1));
    }
    let v: i64 = text.parse().map_err(|e| bad(&e))?;
    Ok((Token::Int(v), i))
}
