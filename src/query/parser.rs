//! Recursive-descent parser. Precedence, low to high:
//! `or` < `and` < `unless` < comparison < `+ -` < `* / %` < `^` (right
//! associative) < unary `+ -` < primary.

use crate::error::{Result, TinyObsError};

use super::ast::{AggOp, BinaryOp, Expr, LabelMatcher, MatchOp, VectorSelector};
use super::lexer::{Lexer, Token};

const AGG_OPS: &[(&str, AggOp)] = &[
    ("sum", AggOp::Sum),
    ("avg", AggOp::Avg),
    ("min", AggOp::Min),
    ("max", AggOp::Max),
    ("count", AggOp::Count),
    ("stddev", AggOp::Stddev),
    ("stdvar", AggOp::Stdvar),
    ("topk", AggOp::Topk),
    ("bottomk", AggOp::Bottomk),
    ("quantile", AggOp::Quantile),
    ("count_values", AggOp::CountValues),
];

pub fn parse(input: &str) -> Result<Expr> {
    let tokens = Lexer::tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    parser.expect(Token::Eof)?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(TinyObsError::ParseError(format!(
                "expected {expected:?}, got {:?}",
                self.peek()
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.advance() {
            Token::Identifier(s) => Ok(s),
            other => Err(TinyObsError::ParseError(format!(
                "expected identifier, got {other:?}"
            ))),
        }
    }

    // or
    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::BinaryExpr {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // and
    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unless()?;
        while *self.peek() == Token::And {
            self.advance();
            let rhs = self.parse_unless()?;
            lhs = Expr::BinaryExpr {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // unless
    fn parse_unless(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while *self.peek() == Token::Unless {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::BinaryExpr {
                op: BinaryOp::Unless,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // == != < <= > >=
    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Neq => BinaryOp::Neq,
                Token::Lt => BinaryOp::Lt,
                Token::Lte => BinaryOp::Lte,
                Token::Gt => BinaryOp::Gt,
                Token::Gte => BinaryOp::Gte,
                _ => break,
            };
            self.advance();
            // `bool` modifier is accepted but has no effect on this
            // executor's (non-boolean) comparison semantics.
            if *self.peek() == Token::Bool {
                self.advance();
            }
            let rhs = self.parse_additive()?;
            lhs = Expr::BinaryExpr {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // + -
    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::BinaryExpr {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // * / %
    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_power()?;
            lhs = Expr::BinaryExpr {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // ^ (right associative)
    fn parse_power(&mut self) -> Result<Expr> {
        let lhs = self.parse_unary()?;
        if *self.peek() == Token::Caret {
            self.advance();
            let rhs = self.parse_power()?;
            return Ok(Expr::BinaryExpr {
                op: BinaryOp::Pow,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    // unary + -
    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Minus => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expr::UnaryExpr { negate: true, expr: Box::new(expr) })
            }
            Token::Plus => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expr::UnaryExpr { negate: false, expr: Box::new(expr) })
            }
            _ => self.parse_postfix_primary(),
        }
    }

    /// Primary, then optional trailing `[duration]` range and/or `offset`.
    fn parse_postfix_primary(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;

        if *self.peek() == Token::LBracket {
            self.advance();
            let duration_secs = match self.advance() {
                Token::Duration(d) => d,
                other => {
                    return Err(TinyObsError::ParseError(format!(
                        "expected duration inside [], got {other:?}"
                    )))
                }
            };
            self.expect(Token::RBracket)?;
            let Expr::VectorSelector(selector) = expr else {
                return Err(TinyObsError::ParseError(
                    "range selector must follow a vector selector".into(),
                ));
            };
            expr = Expr::RangeSelector { selector, duration_secs };
        }

        // `offset` is parsed and discarded; absolute queries already pin
        // [start,end], so offset has no executor-side effect in this scope.
        if *self.peek() == Token::Offset {
            self.advance();
            match self.advance() {
                Token::Duration(_) => {}
                other => {
                    return Err(TinyObsError::ParseError(format!(
                        "expected duration after offset, got {other:?}"
                    )))
                }
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek().clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::NumberLiteral(n))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Identifier(name) => {
                if let Some((_, op)) = AGG_OPS.iter().find(|(kw, _)| *kw == name) {
                    return self.parse_aggregation(*op);
                }
                self.advance();
                if *self.peek() == Token::LParen {
                    return self.parse_function_call(name);
                }
                self.parse_vector_selector(name)
            }
            other => Err(TinyObsError::ParseError(format!(
                "unexpected token in primary position: {other:?}"
            ))),
        }
    }

    fn parse_function_call(&mut self, name: String) -> Result<Expr> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if *self.peek() != Token::RParen {
            args.push(self.parse_or()?);
            while *self.peek() == Token::Comma {
                self.advance();
                args.push(self.parse_or()?);
            }
        }
        self.expect(Token::RParen)?;
        Ok(Expr::FunctionCall { name, args })
    }

    fn parse_aggregation(&mut self, op: AggOp) -> Result<Expr> {
        self.advance(); // consume the aggregator keyword, e.g. "sum"

        // `sum by (labels) (expr)` — grouping clause before the expr.
        let mut leading_group: Option<(Vec<String>, bool)> = None;
        if *self.peek() == Token::By {
            self.advance();
            leading_group = Some((self.parse_label_list()?, false));
        } else if *self.peek() == Token::Without {
            self.advance();
            leading_group = Some((self.parse_label_list()?, true));
        }

        self.expect(Token::LParen)?;
        let mut args = vec![self.parse_or()?];
        while *self.peek() == Token::Comma {
            self.advance();
            args.push(self.parse_or()?);
        }
        self.expect(Token::RParen)?;

        // `sum(expr) by (labels)` — grouping clause after the expr.
        let trailing_group = if leading_group.is_none() {
            if *self.peek() == Token::By {
                self.advance();
                Some((self.parse_label_list()?, false))
            } else if *self.peek() == Token::Without {
                self.advance();
                Some((self.parse_label_list()?, true))
            } else {
                None
            }
        } else {
            None
        };

        let (group_labels, without) = leading_group.or(trailing_group).unwrap_or((vec![], false));

        // `topk`/`bottomk`/`quantile`/`count_values` take a leading
        // parameter argument; the remainder is the vector expr.
        let (param, expr) = if args.len() == 2 {
            (Some(Box::new(args.remove(0))), args.remove(0))
        } else {
            (None, args.remove(0))
        };

        Ok(Expr::AggregateExpr {
            op,
            expr: Box::new(expr),
            group_labels,
            without,
            param,
        })
    }

    fn parse_label_list(&mut self) -> Result<Vec<String>> {
        self.expect(Token::LParen)?;
        let mut labels = Vec::new();
        if *self.peek() != Token::RParen {
            labels.push(self.expect_identifier()?);
            while *self.peek() == Token::Comma {
                self.advance();
                labels.push(self.expect_identifier()?);
            }
        }
        self.expect(Token::RParen)?;
        Ok(labels)
    }

    fn parse_vector_selector(&mut self, name: String) -> Result<Expr> {
        let matchers = if *self.peek() == Token::LBrace {
            self.advance();
            let mut matchers = Vec::new();
            if *self.peek() != Token::RBrace {
                matchers.push(self.parse_matcher()?);
                while *self.peek() == Token::Comma {
                    self.advance();
                    matchers.push(self.parse_matcher()?);
                }
            }
            self.expect(Token::RBrace)?;
            matchers
        } else {
            Vec::new()
        };
        Ok(Expr::VectorSelector(VectorSelector { name, matchers }))
    }

    fn parse_matcher(&mut self) -> Result<LabelMatcher> {
        let name = self.expect_identifier()?;
        let op = match self.advance() {
            Token::LabelEq => MatchOp::Eq,
            Token::Neq => MatchOp::Neq,
            Token::LabelRe => MatchOp::Re,
            Token::LabelNre => MatchOp::Nre,
            other => {
                return Err(TinyObsError::ParseError(format!(
                    "expected label match operator, got {other:?}"
                )))
            }
        };
        let value = match self.advance() {
            Token::String(s) => s,
            other => {
                return Err(TinyObsError::ParseError(format!(
                    "expected string value in matcher, got {other:?}"
                )))
            }
        };
        Ok(LabelMatcher { name, op, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_selector() {
        let expr = parse("cpu_usage").unwrap();
        assert!(matches!(expr, Expr::VectorSelector(_)));
    }

    #[test]
    fn parses_selector_with_matchers() {
        let expr = parse(r#"cpu_usage{host="a"}"#).unwrap();
        let Expr::VectorSelector(sel) = expr else { panic!("wrong variant") };
        assert_eq!(sel.matchers.len(), 1);
        assert_eq!(sel.matchers[0].name, "host");
    }

    #[test]
    fn parses_range_selector() {
        let expr = parse("cpu_usage[5m]").unwrap();
        assert!(matches!(expr, Expr::RangeSelector { duration_secs, .. } if duration_secs == 300.0));
    }

    #[test]
    fn parses_rate_call() {
        let expr = parse("rate(cpu_usage[5m])").unwrap();
        let Expr::FunctionCall { name, args } = expr else { panic!("wrong variant") };
        assert_eq!(name, "rate");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn parses_leading_group_aggregation() {
        let expr = parse("sum by (host) (cpu_usage)").unwrap();
        let Expr::AggregateExpr { group_labels, without, .. } = expr else { panic!("wrong variant") };
        assert_eq!(group_labels, vec!["host".to_string()]);
        assert!(!without);
    }

    #[test]
    fn parses_trailing_group_aggregation() {
        let expr = parse("sum(cpu_usage) by (host)").unwrap();
        let Expr::AggregateExpr { group_labels, .. } = expr else { panic!("wrong variant") };
        assert_eq!(group_labels, vec!["host".to_string()]);
    }

    #[test]
    fn respects_precedence_mul_before_add() {
        let expr = parse("1 + 2 * 3").unwrap();
        let Expr::BinaryExpr { op, rhs, .. } = expr else { panic!("wrong variant") };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*rhs, Expr::BinaryExpr { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        // 2 ^ 3 ^ 2 should parse as 2 ^ (3 ^ 2), not (2 ^ 3) ^ 2.
        let expr = parse("2 ^ 3 ^ 2").unwrap();
        let Expr::BinaryExpr { lhs, rhs, .. } = expr else { panic!("wrong variant") };
        assert!(matches!(*lhs, Expr::NumberLiteral(n) if n == 2.0));
        assert!(matches!(*rhs, Expr::BinaryExpr { .. }));
    }

    #[test]
    fn parses_nested_aggregation_over_rate() {
        let expr = parse("sum by (host) (rate(http_requests_total[5m]))").unwrap();
        assert!(matches!(expr, Expr::AggregateExpr { .. }));
    }
}
