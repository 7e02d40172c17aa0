//! Predicate parser
//!
//! Parses expressions like:
//! - `complexity == 'low'`
//! - `subtasks.0 != null and score > 0.8`
//! - `not (status == 'done' or retries >= 3)`
//!
//! Precedence from loosest to tightest: `or`, `and`, `not`, comparison.

use super::ast::{CompareOp, Expression, Literal};
use thiserror::Error;

/// Predicate parse failure
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message} (at offset {offset})")]
pub struct ConditionError {
    pub message: String,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    True,
    False,
    Null,
    LParen,
    RParen,
}

/// Parse a predicate string into an AST
pub fn parse(input: &str) -> Result<Expression, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConditionError {
            message: "empty condition".to_string(),
            offset: 0,
        });
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error(format!(
            "unexpected trailing token {:?}",
            parser.tokens[parser.pos].1
        )));
    }
    Ok(expr)
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two: Option<Token> = match (c, next) {
            ('=', Some('=')) => Some(Token::Op(CompareOp::Eq)),
            ('!', Some('=')) => Some(Token::Op(CompareOp::NotEq)),
            ('>', Some('=')) => Some(Token::Op(CompareOp::Gte)),
            ('<', Some('=')) => Some(Token::Op(CompareOp::Lte)),
            ('&', Some('&')) => Some(Token::And),
            ('|', Some('|')) => Some(Token::Or),
            _ => None,
        };
        if let Some(token) = two {
            tokens.push((offset, token));
            i += 2;
            continue;
        }

        match c {
            '>' => tokens.push((offset, Token::Op(CompareOp::Gt))),
            '<' => tokens.push((offset, Token::Op(CompareOp::Lt))),
            '!' => tokens.push((offset, Token::Not)),
            '(' => tokens.push((offset, Token::LParen)),
            ')' => tokens.push((offset, Token::RParen)),
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, ch)) => value.push(*ch),
                        None => {
                            return Err(ConditionError {
                                message: "unterminated string literal".to_string(),
                                offset,
                            })
                        }
                    }
                    j += 1;
                }
                tokens.push((offset, Token::Str(value)));
                i = j + 1;
                continue;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let text: String = chars[i..j].iter().map(|(_, ch)| ch).collect();
                let number = text.parse::<f64>().map_err(|_| ConditionError {
                    message: format!("invalid number '{}'", text),
                    offset,
                })?;
                tokens.push((offset, Token::Num(number)));
                i = j;
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].1.is_alphanumeric() || matches!(chars[j].1, '_' | '.' | '-'))
                {
                    j += 1;
                }
                let word: String = chars[i..j].iter().map(|(_, ch)| ch).collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "contains" => Token::Op(CompareOp::Contains),
                    _ => Token::Path(word),
                };
                tokens.push((offset, token));
                i = j;
                continue;
            }
            other => {
                return Err(ConditionError {
                    message: format!("unexpected character '{}'", other),
                    offset,
                })
            }
        }
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> ConditionError {
        let offset = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0);
        ConditionError {
            message: message.into(),
            offset,
        }
    }

    fn parse_or(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ConditionError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::True) => Ok(Expression::True),
            Some(Token::False) => Ok(Expression::False),
            Some(Token::Path(path)) => match self.peek() {
                Some(Token::Op(op)) => {
                    let op = *op;
                    self.advance();
                    let right = self.parse_literal()?;
                    Ok(Expression::Compare { path, op, right })
                }
                _ => Ok(Expression::Truthy(path)),
            },
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token {:?}", other)))
            }
            None => Err(self.error("unexpected end of condition")),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ConditionError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Literal::String(s)),
            Some(Token::Num(n)) => Ok(Literal::Number(n)),
            Some(Token::True) => Ok(Literal::Boolean(true)),
            Some(Token::False) => Ok(Literal::Boolean(false)),
            Some(Token::Null) => Ok(Literal::Null),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a literal"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compare(path: &str, op: CompareOp, right: Literal) -> Expression {
        Expression::Compare {
            path: path.to_string(),
            op,
            right,
        }
    }

    #[test]
    fn test_parse_simple_equality() {
        let expr = parse("complexity == 'low'").unwrap();
        assert_eq!(
            expr,
            compare("complexity", CompareOp::Eq, Literal::String("low".into()))
        );
    }

    #[test]
    fn test_parse_all_comparison_operators() {
        assert_eq!(
            parse("score > 0.8").unwrap(),
            compare("score", CompareOp::Gt, Literal::Number(0.8))
        );
        assert_eq!(
            parse("score >= 5").unwrap(),
            compare("score", CompareOp::Gte, Literal::Number(5.0))
        );
        assert_eq!(
            parse("count <= -2").unwrap(),
            compare("count", CompareOp::Lte, Literal::Number(-2.0))
        );
        assert_eq!(
            parse("count < 3").unwrap(),
            compare("count", CompareOp::Lt, Literal::Number(3.0))
        );
        assert_eq!(
            parse("status != \"done\"").unwrap(),
            compare("status", CompareOp::NotEq, Literal::String("done".into()))
        );
        assert_eq!(
            parse("tags contains 'bug'").unwrap(),
            compare("tags", CompareOp::Contains, Literal::String("bug".into()))
        );
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(
            parse("is_draft == false").unwrap(),
            compare("is_draft", CompareOp::Eq, Literal::Boolean(false))
        );
        assert_eq!(
            parse("error == null").unwrap(),
            compare("error", CompareOp::Eq, Literal::Null)
        );
        assert_eq!(parse("true").unwrap(), Expression::True);
        assert_eq!(parse("false").unwrap(), Expression::False);
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse("a == 1 or b == 2 and c == 3").unwrap();
        match expr {
            Expression::Or(left, right) => {
                assert_eq!(*left, compare("a", CompareOp::Eq, Literal::Number(1.0)));
                assert!(matches!(*right, Expression::And(_, _)));
            }
            other => panic!("Expected Or expression, got {:?}", other),
        }
    }

    #[test]
    fn test_parentheses_and_not() {
        let expr = parse("not (a == 1 or b == 2)").unwrap();
        match expr {
            Expression::Not(inner) => assert!(matches!(*inner, Expression::Or(_, _))),
            other => panic!("Expected Not expression, got {:?}", other),
        }
        assert_eq!(
            parse("!done").unwrap(),
            Expression::Not(Box::new(Expression::Truthy("done".into())))
        );
    }

    #[test]
    fn test_dotted_and_extension_paths() {
        assert_eq!(
            parse("analysis.level == 'high'").unwrap(),
            compare(
                "analysis.level",
                CompareOp::Eq,
                Literal::String("high".into())
            )
        );
        assert_eq!(
            parse("x-trace").unwrap(),
            Expression::Truthy("x-trace".into())
        );
    }

    #[test]
    fn test_operators_inside_strings_are_literal() {
        assert_eq!(
            parse("note == 'a and b'").unwrap(),
            compare("note", CompareOp::Eq, Literal::String("a and b".into()))
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse("").is_err());
        assert!(parse("this is not valid").is_err());
        assert!(parse("a ==").is_err());
        assert!(parse("(a == 1").is_err());
        assert!(parse("a == 'open").is_err());
        assert!(parse("a == 1 )").is_err());
    }
}
