//! Lexer and recursive-descent parser for `${ ... }` expressions.

use super::EvalError;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Traverse {
        base: Box<Expr>,
        segments: Vec<Segment>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Neg(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Name(String),
    Index(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
}

fn syntax(position: usize, message: impl Into<String>) -> EvalError {
    EvalError::Syntax {
        position,
        message: message.into(),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn lex(src: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens: Vec<(usize, Token)> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let after_dot = matches!(tokens.last(), Some((_, Token::Dot)));

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // `header.a.0`: digits after a dot are a path segment, not a number
        if after_dot && c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            i += 1;
            while i < chars.len() {
                let ch = chars[i];
                // hyphens are allowed inside names when a name character follows
                if is_ident_char(ch)
                    || (ch == '-' && chars.get(i + 1).is_some_and(|n| is_ident_char(*n)))
                {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i < chars.len()
                && chars[i] == '.'
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())
            {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| syntax(start, format!("bad number {text:?}")))?;
            tokens.push((start, Token::Number(value)));
            continue;
        }

        if c == '"' || c == '\'' {
            let start = i;
            let quote = c;
            i += 1;
            let mut out = String::new();
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(syntax(start, "unterminated string"));
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&esc) = chars.get(i) else {
                        return Err(syntax(start, "unterminated string"));
                    };
                    i += 1;
                    out.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                } else {
                    out.push(ch);
                }
            }
            tokens.push((start, Token::Str(out)));
            continue;
        }

        let token = match c {
            '.' => Token::Dot,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            other => return Err(syntax(i, format!("unexpected character {other:?}"))),
        };
        tokens.push((i, token));
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.end)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<(), EvalError> {
        let at = self.offset();
        match self.bump() {
            Some(t) if t == want => Ok(()),
            _ => Err(syntax(at, format!("expected {what}"))),
        }
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let base = self.primary()?;
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let at = self.offset();
                    match self.bump() {
                        Some(Token::Ident(name)) => segments.push(Segment::Name(name)),
                        _ => return Err(syntax(at, "expected attribute name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.additive()?;
                    self.expect(Token::RBracket, "']'")?;
                    segments.push(Segment::Index(index));
                }
                _ => break,
            }
        }
        if segments.is_empty() {
            Ok(base)
        } else {
            Ok(Expr::Traverse {
                base: Box::new(base),
                segments,
            })
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let at = self.offset();
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.additive()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() == Some(&Token::RParen) {
                        self.pos += 1;
                    } else {
                        loop {
                            args.push(self.additive()?);
                            let at = self.offset();
                            match self.bump() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                _ => return Err(syntax(at, "expected ',' or ')'")),
                            }
                        }
                    }
                    Ok(Expr::Call { name, args })
                }
                _ => Ok(Expr::Variable(name)),
            },
            Some(_) => Err(syntax(at, "unexpected token")),
            None => Err(syntax(at, "unexpected end of expression")),
        }
    }
}

/// Integral values stay integers so `${1 + 1}` renders as `2`.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Parse one expression (the text between `${` and `}`).
pub fn parse_expression(src: &str) -> Result<Expr, EvalError> {
    let tokens = lex(src)?;
    if tokens.is_empty() {
        return Err(syntax(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: src.len(),
    };
    let expr = parser.additive()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax(parser.offset(), "trailing input"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted_path_with_index() {
        let expr = parse_expression("header.x-api-key.0").unwrap();
        assert_eq!(
            expr,
            Expr::Traverse {
                base: Box::new(Expr::Variable("header".into())),
                segments: vec![
                    Segment::Name("x-api-key".into()),
                    Segment::Name("0".into())
                ],
            }
        );
    }

    #[test]
    fn test_parse_call_with_args() {
        let expr = parse_expression(r#"text("greeting", "World", 2)"#).unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "text");
                assert_eq!(args.len(), 3);
                assert_eq!(args[2], Expr::Literal(Value::from(2)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary { op, rhs, .. } => {
                assert_eq!(op, BinOp::Add);
                assert!(matches!(*rhs, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_bracket_index() {
        let expr = parse_expression(r#"query["hello"][1]"#).unwrap();
        assert!(matches!(expr, Expr::Traverse { ref segments, .. } if segments.len() == 2));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("a.").is_err());
        assert!(parse_expression("f(1,").is_err());
        assert!(parse_expression("\"open").is_err());
        assert!(parse_expression("a b").is_err());
        assert!(parse_expression("a ? b").is_err());
    }
}
