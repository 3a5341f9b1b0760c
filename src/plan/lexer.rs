//! Tokenizer for the plan dialect.

use crate::error::{Error, Result};
use crate::plan::instruction::InstructionPosition;

/// One lexical token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Identifier(String),
    String(String),
    Int(i64),
    True,
    False,
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Colon,
    Equals,
    Newline,
    Eof,
}

impl TokenKind {
    /// Short name for error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{name}'"),
            TokenKind::String(s) => format!("string \"{s}\""),
            TokenKind::Int(n) => format!("integer {n}"),
            TokenKind::True => "'True'".to_string(),
            TokenKind::False => "'False'".to_string(),
            TokenKind::LeftParen => "'('".to_string(),
            TokenKind::RightParen => "')'".to_string(),
            TokenKind::LeftBrace => "'{'".to_string(),
            TokenKind::RightBrace => "'}'".to_string(),
            TokenKind::LeftBracket => "'['".to_string(),
            TokenKind::RightBracket => "']'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Colon => "':'".to_string(),
            TokenKind::Equals => "'='".to_string(),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Eof => "end of script".to_string(),
        }
    }
}

/// Tokenizes a whole script.
///
/// Newlines are significant (they terminate statements) except inside
/// brackets, where the lexer swallows them so literals and calls can span
/// lines.
pub(crate) fn tokenize(source: &str, file: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line: u32 = 1;
    let mut column: u32 = 1;
    let mut bracket_depth: usize = 0;

    while let Some(&c) = chars.peek() {
        let token_line = line;
        let token_column = column;
        match c {
            '\n' => {
                chars.next();
                line += 1;
                column = 1;
                if bracket_depth == 0 {
                    tokens.push(Token {
                        kind: TokenKind::Newline,
                        line: token_line,
                        column: token_column,
                    });
                }
            }
            ' ' | '\t' | '\r' => {
                chars.next();
                column += 1;
            }
            '#' => {
                // Comment to end of line.
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                    column += 1;
                }
            }
            '"' => {
                chars.next();
                column += 1;
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    column += 1;
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let escaped = chars.next().ok_or_else(|| {
                                interpretation_error(file, line, column, "unterminated escape")
                            })?;
                            column += 1;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                '\\' => '\\',
                                '"' => '"',
                                other => {
                                    return Err(interpretation_error(
                                        file,
                                        line,
                                        column,
                                        &format!("unknown escape '\\{other}'"),
                                    ))
                                }
                            });
                        }
                        '\n' => {
                            return Err(interpretation_error(
                                file,
                                line,
                                column,
                                "newline inside string literal",
                            ))
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(interpretation_error(
                        file,
                        token_line,
                        token_column,
                        "unterminated string literal",
                    ));
                }
                tokens.push(Token {
                    kind: TokenKind::String(value),
                    line: token_line,
                    column: token_column,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                column += 1;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        literal.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                let value: i64 = literal.parse().map_err(|_| {
                    interpretation_error(
                        file,
                        token_line,
                        token_column,
                        &format!("invalid integer literal '{literal}'"),
                    )
                })?;
                tokens.push(Token {
                    kind: TokenKind::Int(value),
                    line: token_line,
                    column: token_column,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                let kind = match name.as_str() {
                    "True" => TokenKind::True,
                    "False" => TokenKind::False,
                    _ => TokenKind::Identifier(name),
                };
                tokens.push(Token {
                    kind,
                    line: token_line,
                    column: token_column,
                });
            }
            _ => {
                let kind = match c {
                    '(' => {
                        bracket_depth += 1;
                        TokenKind::LeftParen
                    }
                    ')' => {
                        bracket_depth = bracket_depth.saturating_sub(1);
                        TokenKind::RightParen
                    }
                    '{' => {
                        bracket_depth += 1;
                        TokenKind::LeftBrace
                    }
                    '}' => {
                        bracket_depth = bracket_depth.saturating_sub(1);
                        TokenKind::RightBrace
                    }
                    '[' => {
                        bracket_depth += 1;
                        TokenKind::LeftBracket
                    }
                    ']' => {
                        bracket_depth = bracket_depth.saturating_sub(1);
                        TokenKind::RightBracket
                    }
                    ',' => TokenKind::Comma,
                    ':' => TokenKind::Colon,
                    '=' => TokenKind::Equals,
                    other => {
                        return Err(interpretation_error(
                            file,
                            token_line,
                            token_column,
                            &format!("unexpected character '{other}'"),
                        ))
                    }
                };
                chars.next();
                column += 1;
                tokens.push(Token {
                    kind,
                    line: token_line,
                    column: token_column,
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line,
        column,
    });
    Ok(tokens)
}

pub(crate) fn interpretation_error(file: &str, line: u32, column: u32, message: &str) -> Error {
    Error::Interpretation {
        file: file.to_string(),
        line,
        column,
        message: message.to_string(),
    }
}

pub(crate) fn interpretation_error_at(position: &InstructionPosition, message: &str) -> Error {
    interpretation_error(&position.file, position.line, position.column, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_call() {
        let tokens = tokenize("add_service(id=\"db\")", "t").unwrap();
        let kinds: Vec<&TokenKind> = tokens.iter().map(|t| &t.kind).collect();
        assert!(matches!(kinds[0], TokenKind::Identifier(n) if n == "add_service"));
        assert!(matches!(kinds[1], TokenKind::LeftParen));
        assert!(matches!(kinds[2], TokenKind::Identifier(n) if n == "id"));
        assert!(matches!(kinds[3], TokenKind::Equals));
        assert!(matches!(kinds[4], TokenKind::String(s) if s == "db"));
        assert!(matches!(kinds[5], TokenKind::RightParen));
        assert!(matches!(kinds[6], TokenKind::Eof));
    }

    #[test]
    fn test_newlines_inside_brackets_are_swallowed() {
        let tokens = tokenize("f(\n  a=1,\n)\n", "t").unwrap();
        let newlines = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Newline)
            .count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_positions_are_tracked() {
        let tokens = tokenize("a = 1\nb = 2", "t").unwrap();
        let b = tokens
            .iter()
            .find(|t| matches!(&t.kind, TokenKind::Identifier(n) if n == "b"))
            .unwrap();
        assert_eq!((b.line, b.column), (2, 1));
    }

    #[test]
    fn test_unterminated_string_fails() {
        let err = tokenize("x = \"oops", "t").unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn test_comments_are_skipped() {
        let tokens = tokenize("# a comment\nx = 1", "t").unwrap();
        assert!(tokens
            .iter()
            .any(|t| matches!(&t.kind, TokenKind::Identifier(n) if n == "x")));
    }
}
