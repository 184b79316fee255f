//! Tokenizer for the query language.

use crate::error::{Result, TinyObsError};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier(String),
    Number(f64),
    String(String),
    Duration(f64), // seconds

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,

    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Percent,

    Eq,   // ==
    Neq,  // !=
    Lt,
    Lte,
    Gt,
    Gte,

    LabelEq,  // =
    LabelNeq, // !=  (shared with Neq; disambiguated by parser context)
    LabelRe,  // =~
    LabelNre, // !~

    And,
    Or,
    Unless,

    By,
    Without,
    On,
    Ignoring,
    GroupLeft,
    GroupRight,
    Bool,
    Offset,

    Eof,
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    input: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            input,
        }
    }

    pub fn tokenize(input: &'a str) -> Result<Vec<Token>> {
        let mut lexer = Lexer::new(input);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let done = tok == Token::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek_char(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();
        let Some((start, c)) = self.chars.next() else {
            return Ok(Token::Eof);
        };

        match c {
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            '{' => Ok(Token::LBrace),
            '}' => Ok(Token::RBrace),
            '[' => Ok(Token::LBracket),
            ']' => Ok(Token::RBracket),
            ',' => Ok(Token::Comma),
            ':' => Ok(Token::Colon),
            '+' => Ok(Token::Plus),
            '-' => Ok(Token::Minus),
            '*' => Ok(Token::Star),
            '/' => Ok(Token::Slash),
            '^' => Ok(Token::Caret),
            '%' => Ok(Token::Percent),
            '=' => {
                if self.peek_char() == Some('=') {
                    self.chars.next();
                    Ok(Token::Eq)
                } else if self.peek_char() == Some('~') {
                    self.chars.next();
                    Ok(Token::LabelRe)
                } else {
                    Ok(Token::LabelEq)
                }
            }
            '!' => match self.peek_char() {
                Some('=') => {
                    self.chars.next();
                    Ok(Token::Neq)
                }
                Some('~') => {
                    self.chars.next();
                    Ok(Token::LabelNre)
                }
                _ => Err(TinyObsError::ParseError(format!(
                    "unexpected '!' at byte {start}"
                ))),
            },
            '<' => {
                if self.peek_char() == Some('=') {
                    self.chars.next();
                    Ok(Token::Lte)
                } else {
                    Ok(Token::Lt)
                }
            }
            '>' => {
                if self.peek_char() == Some('=') {
                    self.chars.next();
                    Ok(Token::Gte)
                } else {
                    Ok(Token::Gt)
                }
            }
            '"' => self.read_string(),
            c if c.is_ascii_digit() => self.read_number_or_duration(start, c),
            c if c.is_alphabetic() || c == '_' => self.read_identifier(start),
            other => Err(TinyObsError::ParseError(format!(
                "unexpected character '{other}' at byte {start}"
            ))),
        }
    }

    fn read_string(&mut self) -> Result<Token> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, '"')) => return Ok(Token::String(out)),
                Some((_, '\\')) => {
                    if let Some((_, esc)) = self.chars.next() {
                        out.push(esc);
                    }
                }
                Some((_, c)) => out.push(c),
                None => return Err(TinyObsError::ParseError("unterminated string".into())),
            }
        }
    }

    fn read_number_or_duration(&mut self, start: usize, first: char) -> Result<Token> {
        let mut end = start + first.len_utf8();
        let mut saw_dot = false;
        let mut saw_exp = false;

        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' => {
                    end += c.len_utf8();
                    self.chars.next();
                }
                '.' if !saw_dot && !saw_exp => {
                    saw_dot = true;
                    end += c.len_utf8();
                    self.chars.next();
                }
                'e' | 'E' if !saw_exp => {
                    saw_exp = true;
                    end += c.len_utf8();
                    self.chars.next();
                    if matches!(self.peek_char(), Some('+') | Some('-')) {
                        end += 1;
                        self.chars.next();
                    }
                }
                's' | 'm' | 'h' | 'd' | 'w' | 'y' if !saw_dot && !saw_exp => {
                    // Duration suffix: integer + unit.
                    let unit = c;
                    let number_str = &self.input[start..end];
                    self.chars.next();
                    let n: f64 = number_str
                        .parse()
                        .map_err(|_| TinyObsError::ParseError(format!("bad duration '{number_str}{unit}'")))?;
                    return Ok(Token::Duration(n * unit_seconds(unit)));
                }
                _ => break,
            }
        }

        let number_str = &self.input[start..end];
        let n: f64 = number_str
            .parse()
            .map_err(|_| TinyObsError::ParseError(format!("bad number '{number_str}'")))?;
        Ok(Token::Number(n))
    }

    fn read_identifier(&mut self, start: usize) -> Result<Token> {
        let mut end = start + self.input[start..].chars().next().unwrap().len_utf8();
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == ':' {
                end += c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        let word = &self.input[start..end];
        Ok(match word {
            "and" => Token::And,
            "or" => Token::Or,
            "unless" => Token::Unless,
            "by" => Token::By,
            "without" => Token::Without,
            "on" => Token::On,
            "ignoring" => Token::Ignoring,
            "group_left" => Token::GroupLeft,
            "group_right" => Token::GroupRight,
            "bool" => Token::Bool,
            "offset" => Token::Offset,
            _ => Token::Identifier(word.to_string()),
        })
    }
}

fn unit_seconds(unit: char) -> f64 {
    match unit {
        's' => 1.0,
        'm' => 60.0,
        'h' => 3600.0,
        'd' => 86_400.0,
        'w' => 604_800.0,
        'y' => 31_536_000.0,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_selector_with_matchers() {
        let toks = Lexer::tokenize(r#"cpu_usage{host="a",env!="prod"}"#).unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Identifier("cpu_usage".into()),
                Token::LBrace,
                Token::Identifier("host".into()),
                Token::LabelEq,
                Token::String("a".into()),
                Token::Comma,
                Token::Identifier("env".into()),
                Token::Neq,
                Token::String("prod".into()),
                Token::RBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn tokenizes_duration() {
        let toks = Lexer::tokenize("rate(cpu[5m])").unwrap();
        assert!(toks.contains(&Token::Duration(300.0)));
    }

    #[test]
    fn tokenizes_scientific_number() {
        let toks = Lexer::tokenize("1.5e3").unwrap();
        assert_eq!(toks[0], Token::Number(1500.0));
    }

    #[test]
    fn tokenizes_aggregation_keywords() {
        let toks = Lexer::tokenize("sum by (host) (cpu)").unwrap();
        assert_eq!(toks[0], Token::Identifier("sum".into()));
        assert_eq!(toks[1], Token::By);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(Lexer::tokenize(r#"cpu{host="a}"#).is_err());
    }
}
