//! Lexical analysis for the textual MIR format.
//!
//! The format is line-oriented, so newlines are tokens. Identifiers may contain dots and
//! dollar signs (`math.fact`, `Point.x`, label names from the inliner), which keeps qualified
//! names single tokens; the parser splits them where it needs the pieces.

use crate::error::Location;

/// A token of the textual MIR format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An identifier, possibly dotted.
    Ident(String),
    /// An integer literal. Decimal, `$` hex, or `0x` hex.
    Number(i64),
    /// A string literal with escapes resolved.
    Str(Vec<u8>),
    /// `(`.
    LParen,
    /// `)`.
    RParen,
    /// `{`.
    LBrace,
    /// `}`.
    RBrace,
    /// `[`.
    LBracket,
    /// `]`.
    RBracket,
    /// `,`.
    Comma,
    /// `:`.
    Colon,
    /// `=`.
    Equal,
    /// `->`.
    Arrow,
    /// End of a line.
    Newline,
}

/// Tokenize the whole input, attaching the line number to every token.
pub fn tokenize(text: &str) -> Result<Vec<(Location, Token)>, (Location, String)> {
    let mut tokens = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let location = Location {
            line_number: index + 1,
        };
        tokenize_line(line, location, &mut tokens)?;
        tokens.push((location, Token::Newline));
    }
    Ok(tokens)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$'
}

fn tokenize_line(
    line: &str,
    location: Location,
    tokens: &mut Vec<(Location, Token)>,
) -> Result<(), (Location, String)> {
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            ';' => break,
            '(' => {
                chars.next();
                tokens.push((location, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((location, Token::RParen));
            }
            '{' => {
                chars.next();
                tokens.push((location, Token::LBrace));
            }
            '}' => {
                chars.next();
                tokens.push((location, Token::RBrace));
            }
            '[' => {
                chars.next();
                tokens.push((location, Token::LBracket));
            }
            ']' => {
                chars.next();
                tokens.push((location, Token::RBracket));
            }
            ',' => {
                chars.next();
                tokens.push((location, Token::Comma));
            }
            ':' => {
                chars.next();
                tokens.push((location, Token::Colon));
            }
            '=' => {
                chars.next();
                tokens.push((location, Token::Equal));
            }
            '-' => {
                chars.next();
                match chars.peek() {
                    Some('>') => {
                        chars.next();
                        tokens.push((location, Token::Arrow));
                    }
                    Some(d) if d.is_ascii_digit() => {
                        let number = lex_number(&mut chars, location)?;
                        tokens.push((location, Token::Number(-number)));
                    }
                    _ => return Err((location, "stray '-'".to_string())),
                }
            }
            '$' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_hexdigit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match i64::from_str_radix(&digits, 16) {
                    Ok(value) => tokens.push((location, Token::Number(value))),
                    Err(_) => return Err((location, format!("bad hex literal ${}", digits))),
                }
            }
            '"' => {
                chars.next();
                let bytes = lex_string(&mut chars, location)?;
                tokens.push((location, Token::Str(bytes)));
            }
            _ if c.is_ascii_digit() => {
                let number = lex_number(&mut chars, location)?;
                tokens.push((location, Token::Number(number)));
            }
            _ if is_ident_start(c) => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if is_ident_continue(d) {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((location, Token::Ident(ident)));
            }
            other => return Err((location, format!("unexpected character '{}'", other))),
        }
    }
    Ok(())
}

fn lex_number(
    chars: &mut core::iter::Peekable<core::str::Chars>,
    location: Location,
) -> Result<i64, (Location, String)> {
    let mut digits = String::new();
    while let Some(&d) = chars.peek() {
        if d.is_ascii_alphanumeric() {
            digits.push(d);
            chars.next();
        } else {
            break;
        }
    }
    let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse()
    };
    parsed.map_err(|_| (location, format!("bad number literal {}", digits)))
}

fn lex_string(
    chars: &mut core::iter::Peekable<core::str::Chars>,
    location: Location,
) -> Result<Vec<u8>, (Location, String)> {
    let mut bytes = Vec::new();
    loop {
        match chars.next() {
            None => return Err((location, "unterminated string".to_string())),
            Some('"') => return Ok(bytes),
            Some('\\') => match chars.next() {
                Some('"') => bytes.push(b'"'),
                Some('\\') => bytes.push(b'\\'),
                Some('x') => {
                    let hi = chars.next();
                    let lo = chars.next();
                    match (
                        hi.and_then(|c| c.to_digit(16)),
                        lo.and_then(|c| c.to_digit(16)),
                    ) {
                        (Some(hi), Some(lo)) => bytes.push((hi * 16 + lo) as u8),
                        _ => return Err((location, "bad \\x escape".to_string())),
                    }
                }
                other => {
                    return Err((location, format!("bad escape {:?}", other)));
                }
            },
            Some(c) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<Token> {
        tokenize(text)
            .unwrap()
            .into_iter()
            .map(|(_, token)| token)
            .collect()
    }

    #[test]
    fn dotted_identifiers_stay_whole() {
        assert_eq!(
            kinds("call math.helper(v0)"),
            vec![
                Token::Ident("call".to_string()),
                Token::Ident("math.helper".to_string()),
                Token::LParen,
                Token::Ident("v0".to_string()),
                Token::RParen,
                Token::Newline,
            ]
        );
    }

    #[test]
    fn numbers_in_three_bases() {
        assert_eq!(
            kinds("1 $FF 0x10 -3"),
            vec![
                Token::Number(1),
                Token::Number(255),
                Token::Number(16),
                Token::Number(-3),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn strings_resolve_escapes() {
        assert_eq!(
            kinds("\"a\\\"\\x41\""),
            vec![Token::Str(b"a\"A".to_vec()), Token::Newline]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            kinds("ret ; the result"),
            vec![Token::Ident("ret".to_string()), Token::Newline]
        );
    }

    #[test]
    fn errors_carry_the_line() {
        let err = tokenize("ok\n  ?bad").unwrap_err();
        assert_eq!(err.0.line_number, 2);
    }
}
