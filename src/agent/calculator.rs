//! The `calculator` tool: a restricted safe-eval arithmetic evaluator.
//!
//! Only triggered when an agent's `action_template` supplies a non-empty
//! `{{calculator_hint}}` binding for the current step -- see [`super::Tool`].

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CalculatorError {
    #[error("calculator error: unexpected character {0:?}")]
    UnexpectedChar(char),

    #[error("calculator error: unexpected end of expression")]
    UnexpectedEnd,

    #[error("calculator error: division by zero")]
    DivisionByZero,

    #[error("calculator error: expected closing parenthesis")]
    UnmatchedParen,

    #[error("calculator error: trailing input {0:?}")]
    TrailingInput(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, CalculatorError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::StarStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| CalculatorError::UnexpectedChar(c))?;
                tokens.push(Token::Number(value));
            }
            other => return Err(CalculatorError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

/// Recursive-descent parser over `{+ - * / ** ( ) int float}` only.
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.peek();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> Result<f64, CalculatorError> {
        let mut value = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.next();
                    value += self.parse_term()?;
                }
                Some(Token::Minus) => {
                    self.next();
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> Result<f64, CalculatorError> {
        let mut value = self.parse_power()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.next();
                    value *= self.parse_power()?;
                }
                Some(Token::Slash) => {
                    self.next();
                    let rhs = self.parse_power()?;
                    if rhs == 0.0 {
                        return Err(CalculatorError::DivisionByZero);
                    }
                    value /= rhs;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_power(&mut self) -> Result<f64, CalculatorError> {
        let base = self.parse_unary()?;
        if let Some(Token::StarStar) = self.peek() {
            self.next();
            // Right-associative.
            let exponent = self.parse_power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<f64, CalculatorError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                Ok(-self.parse_unary()?)
            }
            Some(Token::Plus) => {
                self.next();
                self.parse_unary()
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<f64, CalculatorError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(CalculatorError::UnmatchedParen),
                }
            }
            _ => Err(CalculatorError::UnexpectedEnd),
        }
    }
}

/// Evaluate a plain arithmetic expression over `{+ - * / ** ( ) int float}`.
pub fn evaluate(expr: &str) -> Result<f64, CalculatorError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser::new(&tokens);
    let value = parser.parse_expr()?;
    if parser.pos != tokens.len() {
        let remaining: String = expr.chars().skip(parser.pos).collect();
        return Err(CalculatorError::TrailingInput(remaining));
    }
    Ok(value)
}

/// Run the calculator and render its result as the memory-block sentence
/// the Decision Agent appends to the next prompt.
pub fn evaluate_for_memory(expr: &str) -> String {
    match evaluate(expr) {
        Ok(value) => format!("Calculator result: {value}"),
        Err(err) => format!("Calculator error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_arithmetic() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2 ** 3").unwrap(), 8.0);
        assert_eq!(evaluate("-2 + 3").unwrap(), 1.0);
    }

    #[test]
    fn division_by_zero_is_explicit() {
        assert_eq!(evaluate("1 / 0"), Err(CalculatorError::DivisionByZero));
    }

    #[test]
    fn disallowed_token_is_explicit() {
        assert!(matches!(
            evaluate("import os"),
            Err(CalculatorError::UnexpectedChar(_))
        ));
    }

    #[test]
    fn memory_sentence_formats_success_and_error() {
        assert_eq!(evaluate_for_memory("1+1"), "Calculator result: 2");
        assert!(evaluate_for_memory("1/0").starts_with("Calculator error"));
    }
}
