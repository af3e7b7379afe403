use std::iter::Peekable;
use std::str::CharIndices;

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Match,
    NoMatch,
    Null,
    True,
    False,
    Str(String),
    Var(String),
    Regex { pattern: String, flags: String },
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::And => "'&&'".to_string(),
            Self::Or => "'||'".to_string(),
            Self::Not => "'!'".to_string(),
            Self::Eq => "'=='".to_string(),
            Self::Ne => "'!='".to_string(),
            Self::Match => "'=~'".to_string(),
            Self::NoMatch => "'!~'".to_string(),
            Self::Null => "null".to_string(),
            Self::True => "true".to_string(),
            Self::False => "false".to_string(),
            Self::Str(s) => format!("string '{s}'"),
            Self::Var(name) => format!("variable ${name}"),
            Self::Regex { pattern, flags } => format!("regex /{pattern}/{flags}"),
        }
    }
}

const REGEX_FLAGS: &str = "igmsuy";

struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

/// Splits a rule expression into tokens.
///
/// `/` only ever opens a regex literal; the language has no division.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut lexer = Lexer {
        source,
        chars: source.char_indices().peekable(),
    };
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

impl Lexer<'_> {
    fn next_token(&mut self) -> Result<Option<Token>, ExpressionError> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some((pos, c)) = self.chars.next() else {
            return Ok(None);
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '&' => self.expect_second(pos, '&', Token::And)?,
            '|' => self.expect_second(pos, '|', Token::Or)?,
            '=' => match self.chars.next() {
                Some((_, '=')) => Token::Eq,
                Some((_, '~')) => Token::Match,
                _ => return Err(ExpressionError::UnexpectedChar('=', pos)),
            },
            '!' => match self.chars.peek() {
                Some((_, '=')) => {
                    self.chars.next();
                    Token::Ne
                }
                Some((_, '~')) => {
                    self.chars.next();
                    Token::NoMatch
                }
                _ => Token::Not,
            },
            '\'' | '"' => self.string(pos, c)?,
            '/' => self.regex(pos)?,
            '$' => self.variable(pos)?,
            c if c.is_ascii_alphabetic() => self.keyword(pos)?,
            other => return Err(ExpressionError::UnexpectedChar(other, pos)),
        };

        Ok(Some(token))
    }

    fn expect_second(&mut self, pos: usize, second: char, token: Token) -> Result<Token, ExpressionError> {
        match self.chars.next() {
            Some((_, c)) if c == second => Ok(token),
            _ => Err(ExpressionError::UnexpectedChar(second, pos)),
        }
    }

    fn string(&mut self, start: usize, quote: char) -> Result<Token, ExpressionError> {
        let mut text = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '\\' => match self.chars.next() {
                    Some((_, escaped)) => text.push(escaped),
                    None => break,
                },
                c if c == quote => return Ok(Token::Str(text)),
                c => text.push(c),
            }
        }
        Err(ExpressionError::UnterminatedString(start))
    }

    fn regex(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let mut pattern = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, '/')) => pattern.push('/'),
                    Some((_, escaped)) => {
                        pattern.push('\\');
                        pattern.push(escaped);
                    }
                    None => return Err(ExpressionError::UnterminatedRegex(start)),
                },
                Some((_, '/')) => break,
                Some((_, c)) => pattern.push(c),
                None => return Err(ExpressionError::UnterminatedRegex(start)),
            }
        }

        let mut flags = String::new();
        while let Some((pos, c)) = self.chars.next_if(|(_, c)| c.is_ascii_alphabetic()) {
            if !REGEX_FLAGS.contains(c) {
                return Err(ExpressionError::UnknownFlag(c, pos));
            }
            flags.push(c);
        }

        Ok(Token::Regex { pattern, flags })
    }

    fn variable(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let braced = self.chars.next_if(|(_, c)| *c == '{').is_some();
        let name = self.word();
        if braced && self.chars.next_if(|(_, c)| *c == '}').is_none() {
            return Err(ExpressionError::UnterminatedVariable(start));
        }
        if name.is_empty() {
            return Err(ExpressionError::UnexpectedChar('$', start));
        }
        Ok(Token::Var(name))
    }

    fn keyword(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let rest = self.word();
        let end = start + 1 + rest.len();
        match &self.source[start..end] {
            "null" => Ok(Token::Null),
            "true" => Ok(Token::True),
            "false" => Ok(Token::False),
            other => Err(ExpressionError::UnknownWord(other.to_string(), start)),
        }
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some((_, c)) = self.chars.next_if(|(_, c)| c.is_alphanumeric() || *c == '_') {
            word.push(c);
        }
        word
    }
}
