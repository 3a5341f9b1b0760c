//! Recursive-descent parser for the plan dialect.
//!
//! The dialect is deliberately small and lambda-free: a script is a
//! sequence of statements, each either an assignment (`name = expr`) or a
//! bare expression; expressions are literals, identifiers, dict/list
//! literals, and calls with positional and keyword arguments.

use super::instruction::InstructionPosition;
use super::lexer::{interpretation_error, tokenize, Token, TokenKind};
use crate::error::Result;

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    String(String, InstructionPosition),
    Int(i64, InstructionPosition),
    Bool(bool, InstructionPosition),
    Identifier(String, InstructionPosition),
    Call {
        name: String,
        args: Vec<CallArg>,
        position: InstructionPosition,
    },
    Dict(Vec<(Expr, Expr)>, InstructionPosition),
    List(Vec<Expr>, InstructionPosition),
}

impl Expr {
    /// Renders the expression back to source form with normalized
    /// whitespace. The executor's canonical instruction text is built from
    /// this, so it matches the script excerpt at the call site.
    pub fn render(&self) -> String {
        match self {
            Expr::String(s, _) => super::value::quote(s),
            Expr::Int(n, _) => n.to_string(),
            Expr::Bool(true, _) => "True".to_string(),
            Expr::Bool(false, _) => "False".to_string(),
            Expr::Identifier(name, _) => name.clone(),
            Expr::Call { name, args, .. } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|arg| match &arg.name {
                        Some(arg_name) => format!("{arg_name}={}", arg.value.render()),
                        None => arg.value.render(),
                    })
                    .collect();
                format!("{name}({})", rendered.join(", "))
            }
            Expr::Dict(entries, _) => {
                let rendered: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.render(), value.render()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Expr::List(items, _) => {
                let rendered: Vec<String> = items.iter().map(Expr::render).collect();
                format!("[{}]", rendered.join(", "))
            }
        }
    }

    pub fn position(&self) -> &InstructionPosition {
        match self {
            Expr::String(_, p)
            | Expr::Int(_, p)
            | Expr::Bool(_, p)
            | Expr::Identifier(_, p)
            | Expr::Call { position: p, .. }
            | Expr::Dict(_, p)
            | Expr::List(_, p) => p,
        }
    }
}

/// One call argument: positional when `name` is `None`.
#[derive(Debug, Clone)]
pub(crate) struct CallArg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub(crate) enum Statement {
    Assign {
        name: String,
        value: Expr,
    },
    Expr(Expr),
}

/// Parses a whole script.
pub(crate) fn parse(source: &str, file: &str) -> Result<Vec<Statement>> {
    let tokens = tokenize(source, file)?;
    let mut parser = Parser {
        tokens,
        index: 0,
        file: file.to_string(),
    };
    parser.parse_script()
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    file: String,
}

impl Parser {
    fn parse_script(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if self.peek_kind() == &TokenKind::Eof {
                return Ok(statements);
            }
            statements.push(self.parse_statement()?);
            // A statement ends at a newline or the end of the script.
            match self.peek_kind() {
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Eof => {}
                other => {
                    let token = self.peek();
                    return Err(interpretation_error(
                        &self.file,
                        token.line,
                        token.column,
                        &format!("expected end of statement, found {}", other.describe()),
                    ));
                }
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        // Lookahead for `ident =` distinguishes assignment from expression.
        if let TokenKind::Identifier(name) = self.peek_kind().clone() {
            if self.peek_ahead_kind(1) == &TokenKind::Equals {
                self.advance();
                self.advance();
                let value = self.parse_expr()?;
                return Ok(Statement::Assign { name, value });
            }
        }
        Ok(Statement::Expr(self.parse_expr()?))
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        let position = self.position_of(&token);
        match token.kind {
            TokenKind::String(value) => {
                self.advance();
                Ok(Expr::String(value, position))
            }
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::Int(value, position))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true, position))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false, position))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if self.peek_kind() == &TokenKind::LeftParen {
                    self.parse_call(name, position)
                } else {
                    Ok(Expr::Identifier(name, position))
                }
            }
            TokenKind::LeftBrace => self.parse_dict(position),
            TokenKind::LeftBracket => self.parse_list(position),
            other => Err(interpretation_error(
                &self.file,
                token.line,
                token.column,
                &format!("expected an expression, found {}", other.describe()),
            )),
        }
    }

    fn parse_call(&mut self, name: String, position: InstructionPosition) -> Result<Expr> {
        self.expect(&TokenKind::LeftParen)?;
        let mut args = Vec::new();
        loop {
            if self.peek_kind() == &TokenKind::RightParen {
                self.advance();
                break;
            }

            // `ident =` marks a keyword argument; positional and keyword
            // arguments may mix freely, positionals fill the unbound
            // parameters in declaration order.
            let arg = if let TokenKind::Identifier(arg_name) = self.peek_kind().clone() {
                if self.peek_ahead_kind(1) == &TokenKind::Equals {
                    self.advance();
                    self.advance();
                    CallArg {
                        name: Some(arg_name),
                        value: self.parse_expr()?,
                    }
                } else {
                    CallArg {
                        name: None,
                        value: self.parse_expr()?,
                    }
                }
            } else {
                CallArg {
                    name: None,
                    value: self.parse_expr()?,
                }
            };
            args.push(arg);

            match self.peek_kind() {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RightParen => {
                    self.advance();
                    break;
                }
                other => {
                    let token = self.peek();
                    return Err(interpretation_error(
                        &self.file,
                        token.line,
                        token.column,
                        &format!("expected ',' or ')' in call, found {}", other.describe()),
                    ));
                }
            }
        }
        Ok(Expr::Call {
            name,
            args,
            position,
        })
    }

    fn parse_dict(&mut self, position: InstructionPosition) -> Result<Expr> {
        self.expect(&TokenKind::LeftBrace)?;
        let mut entries = Vec::new();
        loop {
            if self.peek_kind() == &TokenKind::RightBrace {
                self.advance();
                break;
            }
            let key = self.parse_expr()?;
            self.expect(&TokenKind::Colon)?;
            let value = self.parse_expr()?;
            entries.push((key, value));

            match self.peek_kind() {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RightBrace => {
                    self.advance();
                    break;
                }
                other => {
                    let token = self.peek();
                    return Err(interpretation_error(
                        &self.file,
                        token.line,
                        token.column,
                        &format!("expected ',' or '}}' in dict, found {}", other.describe()),
                    ));
                }
            }
        }
        Ok(Expr::Dict(entries, position))
    }

    fn parse_list(&mut self, position: InstructionPosition) -> Result<Expr> {
        self.expect(&TokenKind::LeftBracket)?;
        let mut items = Vec::new();
        loop {
            if self.peek_kind() == &TokenKind::RightBracket {
                self.advance();
                break;
            }
            items.push(self.parse_expr()?);
            match self.peek_kind() {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RightBracket => {
                    self.advance();
                    break;
                }
                other => {
                    let token = self.peek();
                    return Err(interpretation_error(
                        &self.file,
                        token.line,
                        token.column,
                        &format!("expected ',' or ']' in list, found {}", other.describe()),
                    ));
                }
            }
        }
        Ok(Expr::List(items, position))
    }

    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn peek(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_ahead_kind(&self, offset: usize) -> &TokenKind {
        let index = (self.index + offset).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    fn expect(&mut self, expected: &TokenKind) -> Result<()> {
        let token = self.peek().clone();
        if &token.kind == expected {
            self.advance();
            Ok(())
        } else {
            Err(interpretation_error(
                &self.file,
                token.line,
                token.column,
                &format!(
                    "expected {}, found {}",
                    expected.describe(),
                    token.kind.describe()
                ),
            ))
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek_kind() == &TokenKind::Newline {
            self.advance();
        }
    }

    fn position_of(&self, token: &Token) -> InstructionPosition {
        InstructionPosition {
            file: self.file.clone(),
            line: token.line,
            column: token.column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_call_with_mixed_args() {
        let statements =
            parse("add_service(id=\"db\", config(image=\"postgres\"))", "t").unwrap();
        assert_eq!(statements.len(), 1);
        let Statement::Expr(Expr::Call { name, args, .. }) = &statements[0] else {
            panic!("expected a call statement");
        };
        assert_eq!(name, "add_service");
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].name.as_deref(), Some("id"));
        assert!(args[1].name.is_none());
        assert!(matches!(&args[1].value, Expr::Call { name, .. } if name == "config"));
    }

    #[test]
    fn test_parse_assignment_and_reference() {
        let statements = parse("db = add_service(id=\"db\")\ndb", "t").unwrap();
        assert_eq!(statements.len(), 2);
        assert!(matches!(&statements[0], Statement::Assign { name, .. } if name == "db"));
        assert!(matches!(&statements[1], Statement::Expr(Expr::Identifier(n, _)) if n == "db"));
    }

    #[test]
    fn test_parse_dict_literal() {
        let statements = parse("x = {\"pg\": port(5432), \"web\": 80}", "t").unwrap();
        let Statement::Assign { value: Expr::Dict(entries, _), .. } = &statements[0] else {
            panic!("expected a dict assignment");
        };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_positional_after_keyword_allowed() {
        let statements = parse("f(a=1, 2)", "t").unwrap();
        let Statement::Expr(Expr::Call { args, .. }) = &statements[0] else {
            panic!("expected a call");
        };
        assert_eq!(args[0].name.as_deref(), Some("a"));
        assert!(args[1].name.is_none());
    }

    #[test]
    fn test_call_position_recorded() {
        let statements = parse("\n\n  remove_service(id=\"db\")", "t").unwrap();
        let Statement::Expr(Expr::Call { position, .. }) = &statements[0] else {
            panic!("expected a call");
        };
        assert_eq!((position.line, position.column), (3, 3));
    }
}
