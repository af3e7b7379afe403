use std::fmt;
use std::iter::Peekable;
use std::vec::IntoIter;

use regex::{Regex, RegexBuilder};

use super::lexer::Token;
use super::ExpressionError;

/// Result of evaluating a sub-expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Null,
    Bool(bool),
    Str(String),
}

impl Operand {
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Str(s) => !s.is_empty(),
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Str(s) => Some(s),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => write!(f, "'{s}'"),
        }
    }
}

#[derive(Debug)]
pub enum Pattern {
    Literal(Regex),
    Dynamic(Box<Expr>),
}

#[derive(Debug)]
pub enum Expr {
    Literal(Operand),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Equals {
        left: Box<Expr>,
        right: Box<Expr>,
        negated: bool,
    },
    Matches {
        subject: Box<Expr>,
        pattern: Pattern,
        negated: bool,
    },
}

impl Expr {
    /// Evaluates against a variable lookup; unset variables are `null`.
    ///
    /// `&&` and `||` short-circuit and yield one of their operands.
    pub fn evaluate<'v>(
        &self,
        lookup: &impl Fn(&str) -> Option<&'v str>,
    ) -> Result<Operand, ExpressionError> {
        Ok(match self {
            Self::Literal(operand) => operand.clone(),
            Self::Var(name) => lookup(name).map_or(Operand::Null, |v| Operand::Str(v.to_string())),
            Self::Not(inner) => Operand::Bool(!inner.evaluate(lookup)?.is_truthy()),
            Self::And(left, right) => {
                let left = left.evaluate(lookup)?;
                if left.is_truthy() {
                    right.evaluate(lookup)?
                } else {
                    left
                }
            }
            Self::Or(left, right) => {
                let left = left.evaluate(lookup)?;
                if left.is_truthy() {
                    left
                } else {
                    right.evaluate(lookup)?
                }
            }
            Self::Equals {
                left,
                right,
                negated,
            } => {
                let equal = left.evaluate(lookup)? == right.evaluate(lookup)?;
                Operand::Bool(equal != *negated)
            }
            Self::Matches {
                subject,
                pattern,
                negated,
            } => {
                // A null subject never matches, whichever the polarity.
                let Some(subject) = subject.evaluate(lookup)?.into_text() else {
                    return Ok(Operand::Bool(false));
                };
                let matched = match pattern {
                    Pattern::Literal(regex) => regex.is_match(&subject),
                    Pattern::Dynamic(expr) => match expr.evaluate(lookup)?.into_text() {
                        Some(source) => Regex::new(&source)?.is_match(&subject),
                        None => return Ok(Operand::Bool(false)),
                    },
                };
                Operand::Bool(matched != *negated)
            }
        })
    }
}

fn compile_literal(pattern: &str, flags: &str) -> Result<Regex, ExpressionError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            _ => &mut builder,
        };
    }
    Ok(builder.build()?)
}

/// Recursive-descent parser.
///
/// ```text
/// or         := and ( "||" and )*
/// and        := comparison ( "&&" comparison )*
/// comparison := unary ( ("==" | "!=") unary | ("=~" | "!~") pattern )?
/// unary      := "!" unary | primary
/// primary    := "(" or ")" | string | null | true | false | variable
/// pattern    := regex | unary
/// ```
pub struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter().peekable(),
        }
    }

    pub fn parse(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.or()?;
        match self.tokens.next() {
            None => Ok(expr),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.and()?;
        while self.tokens.next_if_eq(&Token::Or).is_some() {
            expr = Expr::Or(Box::new(expr), Box::new(self.and()?));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.comparison()?;
        while self.tokens.next_if_eq(&Token::And).is_some() {
            expr = Expr::And(Box::new(expr), Box::new(self.comparison()?));
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.unary()?;
        let expr = match self.tokens.peek() {
            Some(Token::Eq | Token::Ne) => {
                let negated = self.tokens.next() == Some(Token::Ne);
                Expr::Equals {
                    left: Box::new(left),
                    right: Box::new(self.unary()?),
                    negated,
                }
            }
            Some(Token::Match | Token::NoMatch) => {
                let negated = self.tokens.next() == Some(Token::NoMatch);
                Expr::Matches {
                    subject: Box::new(left),
                    pattern: self.pattern()?,
                    negated,
                }
            }
            _ => return Ok(left),
        };

        match self.tokens.peek() {
            Some(token @ (Token::Eq | Token::Ne | Token::Match | Token::NoMatch)) => {
                Err(ExpressionError::UnexpectedToken(token.describe()))
            }
            _ => Ok(expr),
        }
    }

    fn pattern(&mut self) -> Result<Pattern, ExpressionError> {
        let literal = self
            .tokens
            .next_if(|token| matches!(token, Token::Regex { .. }));
        if let Some(Token::Regex { pattern, flags }) = literal {
            return Ok(Pattern::Literal(compile_literal(&pattern, &flags)?));
        }
        Ok(Pattern::Dynamic(Box::new(self.unary()?)))
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.tokens.next_if_eq(&Token::Not).is_some() {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.tokens.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.tokens.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(Token::Str(text)) => Ok(Expr::Literal(Operand::Str(text))),
            Some(Token::Null) => Ok(Expr::Literal(Operand::Null)),
            Some(Token::True) => Ok(Expr::Literal(Operand::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Operand::Bool(false))),
            Some(Token::Var(name)) => Ok(Expr::Var(name)),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::lexer::tokenize;
    use super::*;

    fn eval(expr: &str, vars: &[(&str, &str)]) -> Operand {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        let lookup = |name: &str| vars.get(name).copied();
        Parser::new(tokenize(expr).unwrap())
            .parse()
            .unwrap()
            .evaluate(&lookup)
            .unwrap()
    }

    fn parse_err(expr: &str) -> ExpressionError {
        Parser::new(tokenize(expr).unwrap()).parse().unwrap_err()
    }

    #[test]
    fn test_logical_operators_yield_operands() {
        assert_eq!(eval("$A && $B", &[("A", "x"), ("B", "y")]), Operand::Str("y".to_string()));
        assert_eq!(eval("$A && $B", &[("B", "y")]), Operand::Null);
        assert_eq!(eval("$A || $B", &[("A", ""), ("B", "y")]), Operand::Str("y".to_string()));
        assert_eq!(eval("$A || 'fallback'", &[("A", "x")]), Operand::Str("x".to_string()));
    }

    #[test]
    fn test_precedence() {
        // `&&` binds tighter than `||`.
        assert!(eval("true || false && false", &[]).is_truthy());
        assert!(!eval("(true || false) && false", &[]).is_truthy());
        // `!` binds tighter than comparison.
        assert_eq!(eval("!$A == false", &[("A", "x")]), Operand::Bool(true));
        assert_eq!(eval("!($A == 'x')", &[("A", "x")]), Operand::Bool(false));
    }

    #[test]
    fn test_equality_is_structural() {
        assert_eq!(eval("$A == null", &[]), Operand::Bool(true));
        assert_eq!(eval("$A == ''", &[]), Operand::Bool(false));
        assert_eq!(eval("$A == 'true'", &[("A", "true")]), Operand::Bool(true));
        assert_eq!(eval("$A == true", &[("A", "true")]), Operand::Bool(false));
    }

    #[test]
    fn test_match_polarity_and_null_subject() {
        assert_eq!(eval("$A =~ /^ma/", &[("A", "main")]), Operand::Bool(true));
        assert_eq!(eval("$A !~ /^ma/", &[("A", "main")]), Operand::Bool(false));
        assert_eq!(eval("$A =~ /^ma/", &[]), Operand::Bool(false));
        assert_eq!(eval("$A !~ /^ma/", &[]), Operand::Bool(false));
    }

    #[test]
    fn test_dynamic_pattern() {
        assert_eq!(
            eval("$A =~ $B", &[("A", "ci-skip-job-1"), ("B", "ci-skip-job-")]),
            Operand::Bool(true)
        );
        assert_eq!(eval("$A =~ $B", &[("A", "main")]), Operand::Bool(false));
        assert_eq!(eval("$A !~ $B", &[("A", "main")]), Operand::Bool(false));
    }

    #[test]
    fn test_regex_flags() {
        assert_eq!(eval("$A =~ /MAIN/i", &[("A", "main")]), Operand::Bool(true));
        assert_eq!(eval("$A =~ /^b$/m", &[("A", "a\nb")]), Operand::Bool(true));
        assert_eq!(eval("$A =~ /a.b/s", &[("A", "a\nb")]), Operand::Bool(true));
        assert_eq!(eval("$A =~ /a/gu", &[("A", "a")]), Operand::Bool(true));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse_err("$A =="), ExpressionError::UnexpectedEnd));
        assert!(matches!(parse_err("($A"), ExpressionError::UnexpectedEnd));
        assert!(matches!(parse_err("$A $B"), ExpressionError::UnexpectedToken(_)));
        assert!(matches!(parse_err("$A == $B == $C"), ExpressionError::UnexpectedToken(_)));
        assert!(matches!(parse_err("&& $A"), ExpressionError::UnexpectedToken(_)));
        assert!(matches!(parse_err("$A =~ /(/"), ExpressionError::Regex(_)));
    }
}
