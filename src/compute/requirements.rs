//! Agent capabilities and the requirements tasks place on them.
//!
//! Requirements objects are stored in the blob store as JSON and shared by
//! every task in a queue:
//!
//! ```json
//! {
//!   "condition": "os == linux && (arch == x64 || arch == arm64)",
//!   "resources": { "cpu": 4, "ram_gb": 8 },
//!   "exclusive": false
//! }
//! ```
//!
//! # Condition Syntax
//!
//! - `key == value`, `key != value`: compare an agent property
//! - `key`: the agent has the property, with any value
//! - `!expr`, `a && b`, `a || b`, parentheses
//!
//! Values are bare words or double-quoted strings. `&&` binds tighter
//! than `||`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConditionError;

/// Execution requirements for the tasks of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Condition on agent properties. `None` accepts every agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Minimum amount of each resource the agent must offer.
    #[serde(default)]
    pub resources: BTreeMap<String, u32>,
    /// Whether the task needs the agent to itself.
    #[serde(default)]
    pub exclusive: bool,
}

impl Requirements {
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, amount: u32) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Parses the condition, if any.
    pub fn parsed_condition(&self) -> Result<Option<Condition>, ConditionError> {
        self.condition.as_deref().map(Condition::parse).transpose()
    }

    /// Returns whether `agent` satisfies the condition and offers enough of
    /// every requested resource. An unparseable condition matches nothing.
    ///
    /// Parses the condition on every call; use [`CompiledRequirements`] when
    /// matching the same requirements repeatedly.
    pub fn is_met_by(&self, agent: &Agent) -> bool {
        let condition_holds = match self.parsed_condition() {
            Ok(Some(condition)) => condition.evaluate(agent),
            Ok(None) => true,
            Err(_) => false,
        };
        condition_holds && self.resources_offered_by(agent)
    }

    fn resources_offered_by(&self, agent: &Agent) -> bool {
        self.resources
            .iter()
            .all(|(name, needed)| agent.resources.get(name).is_some_and(|have| have >= needed))
    }
}

/// Requirements with their condition parsed once up front.
#[derive(Debug, Clone)]
pub struct CompiledRequirements {
    pub requirements: Requirements,
    condition: Result<Option<Condition>, ConditionError>,
}

impl CompiledRequirements {
    pub fn compile(requirements: Requirements) -> Self {
        let condition = requirements.parsed_condition();
        if let Err(e) = &condition {
            tracing::warn!(
                condition = requirements.condition.as_deref().unwrap_or_default(),
                error = %e,
                "Requirements condition is invalid; no agent will match"
            );
        }
        Self {
            requirements,
            condition,
        }
    }

    /// The parse error of the condition, if it has one.
    pub fn condition_error(&self) -> Option<&ConditionError> {
        self.condition.as_ref().err()
    }

    /// Same as [`Requirements::is_met_by`], without reparsing.
    pub fn is_met_by(&self, agent: &Agent) -> bool {
        let condition_holds = match &self.condition {
            Ok(Some(condition)) => condition.evaluate(agent),
            Ok(None) => true,
            Err(_) => false,
        };
        condition_holds && self.requirements.resources_offered_by(agent)
    }
}

/// A worker polling for leases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Properties as `key=value` pairs, or bare `key` flags.
    #[serde(default)]
    pub properties: Vec<String>,
    /// Resources the agent can reserve for leases.
    #[serde(default)]
    pub resources: BTreeMap<String, u32>,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.properties.push(property.into());
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, amount: u32) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    /// Values of every property named `key`. Bare flags yield `""`.
    pub fn property_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.properties.iter().filter_map(move |property| {
            match property.split_once('=') {
                Some((name, value)) if name.trim() == key => Some(value.trim()),
                None if property.trim() == key => Some(""),
                _ => None,
            }
        })
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.property_values(key).next().is_some()
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Exists(String),
    Equals(String, String),
    NotEquals(String, String),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let condition = parser.parse_or()?;

        match parser.tokens.get(parser.pos) {
            None => Ok(condition),
            Some((token, offset)) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                offset: *offset,
            }),
        }
    }

    pub fn evaluate(&self, agent: &Agent) -> bool {
        match self {
            Condition::Exists(key) => agent.has_property(key),
            Condition::Equals(key, value) => agent
                .property_values(key)
                .any(|v| v.eq_ignore_ascii_case(value)),
            Condition::NotEquals(key, value) => !agent
                .property_values(key)
                .any(|v| v.eq_ignore_ascii_case(value)),
            Condition::Not(inner) => !inner.evaluate(agent),
            Condition::And(left, right) => left.evaluate(agent) && right.evaluate(agent),
            Condition::Or(left, right) => left.evaluate(agent) || right.evaluate(agent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Eq,
    NotEq,
    Not,
    And,
    Or,
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Word(word) => f.write_str(word),
            Token::Eq => f.write_str("=="),
            Token::NotEq => f.write_str("!="),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/')
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::Open,
            ')' => Token::Close,
            '=' | '&' | '|' => {
                match chars.next_if(|&(_, next)| next == c) {
                    Some(_) => {}
                    None => {
                        return Err(ConditionError::UnexpectedToken {
                            found: c.to_string(),
                            offset,
                        })
                    }
                }
                match c {
                    '=' => Token::Eq,
                    '&' => Token::And,
                    _ => Token::Or,
                }
            }
            '!' => match chars.next_if(|&(_, next)| next == '=') {
                Some(_) => Token::NotEq,
                None => Token::Not,
            },
            '"' => {
                let mut word = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    word.push(c);
                }
                if !closed {
                    return Err(ConditionError::UnterminatedString(offset));
                }
                Token::Word(word)
            }
            c if is_word_char(c) => {
                let mut word = c.to_string();
                while let Some((_, next)) = chars.next_if(|&(_, next)| is_word_char(next)) {
                    word.push(next);
                }
                Token::Word(word)
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    found: other.to_string(),
                    offset,
                })
            }
        };
        tokens.push((token, offset));
    }

    Ok(tokens)
}

/// Deepest nesting of `!`, parentheses and chained operators a condition may use.
pub const MAX_CONDITION_DEPTH: usize = 64;

/// Recursive-descent parser over the token stream.
struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn next(&mut self, expected: &'static str) -> Result<(Token, usize), ConditionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ConditionError::UnexpectedEnd(expected))?;
        self.pos += 1;
        Ok(token)
    }

    /// Consumes `expected` if it is the next token, returning its offset.
    fn eat(&mut self, expected: &Token) -> Option<usize> {
        match self.tokens.get(self.pos) {
            Some((token, offset)) if token == expected => {
                self.pos += 1;
                Some(*offset)
            }
            _ => None,
        }
    }

    fn descend(&mut self, offset: usize) -> Result<(), ConditionError> {
        if self.depth >= MAX_CONDITION_DEPTH {
            return Err(ConditionError::TooDeep {
                max: MAX_CONDITION_DEPTH,
                offset,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let depth = self.depth;
        let mut left = self.parse_and()?;
        while let Some(offset) = self.eat(&Token::Or) {
            self.descend(offset)?;
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let depth = self.depth;
        let mut left = self.parse_unary()?;
        while let Some(offset) = self.eat(&Token::And) {
            self.descend(offset)?;
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionError> {
        match self.eat(&Token::Not) {
            Some(offset) => {
                self.descend(offset)?;
                let inner = self.parse_unary()?;
                self.depth -= 1;
                Ok(Condition::Not(Box::new(inner)))
            }
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Condition, ConditionError> {
        match self.next("a property or '('")? {
            (Token::Open, offset) => {
                self.descend(offset)?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next("')'")? {
                    (Token::Close, _) => Ok(inner),
                    (token, offset) => Err(ConditionError::UnexpectedToken {
                        found: token.to_string(),
                        offset,
                    }),
                }
            }
            (Token::Word(key), _) => match self.peek() {
                Some(Token::Eq) | Some(Token::NotEq) => {
                    let (op, _) = self.next("'==' or '!='")?;
                    let value = match self.next("a value")? {
                        (Token::Word(value), _) => value,
                        (token, offset) => {
                            return Err(ConditionError::UnexpectedToken {
                                found: token.to_string(),
                                offset,
                            })
                        }
                    };
                    Ok(if op == Token::Eq {
                        Condition::Equals(key, value)
                    } else {
                        Condition::NotEquals(key, value)
                    })
                }
                _ => Ok(Condition::Exists(key)),
            },
            (token, offset) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_x64() -> Agent {
        Agent::new("agent-1")
            .with_property("os=linux")
            .with_property("arch=x64")
            .with_property("gpu")
            .with_resource("cpu", 8)
    }

    #[test]
    fn test_parse_precedence() {
        let parsed = Condition::parse("a || b && c").unwrap();
        assert_eq!(
            parsed,
            Condition::Or(
                Box::new(Condition::Exists("a".to_string())),
                Box::new(Condition::And(
                    Box::new(Condition::Exists("b".to_string())),
                    Box::new(Condition::Exists("c".to_string())),
                )),
            )
        );
    }

    #[test]
    fn test_evaluate_against_agent() {
        let agent = linux_x64();
        let cases = [
            ("os == linux", true),
            ("os == Linux", true),
            ("os != linux", false),
            ("arch == arm64", false),
            ("os == linux && (arch == arm64 || arch == x64)", true),
            ("gpu", true),
            ("!gpu", false),
            ("missing", false),
            (r#"os == "linux""#, true),
        ];

        for (condition, expected) in cases {
            let parsed = Condition::parse(condition).unwrap();
            assert_eq!(parsed.evaluate(&agent), expected, "condition: {condition}");
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Condition::parse("os =="),
            Err(ConditionError::UnexpectedEnd("a value"))
        );
        assert!(matches!(
            Condition::parse("os = linux"),
            Err(ConditionError::UnexpectedToken { offset: 3, .. })
        ));
        assert!(matches!(
            Condition::parse("(os == linux"),
            Err(ConditionError::UnexpectedEnd(_))
        ));
        assert_eq!(
            Condition::parse(r#"os == "linux"#),
            Err(ConditionError::UnterminatedString(6))
        );
        assert!(Condition::parse("a b").is_err());
    }

    #[test]
    fn test_requirements_check_resources() {
        let agent = linux_x64();

        assert!(Requirements::default().is_met_by(&agent));
        assert!(Requirements::default()
            .with_condition("os == linux")
            .with_resource("cpu", 8)
            .is_met_by(&agent));
        assert!(!Requirements::default()
            .with_resource("cpu", 16)
            .is_met_by(&agent));
        assert!(!Requirements::default()
            .with_resource("ram_gb", 1)
            .is_met_by(&agent));
        assert!(!Requirements::default()
            .with_condition("os ==")
            .is_met_by(&agent));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let negations = format!("{}a", "!".repeat(200_000));
        assert_eq!(
            Condition::parse(&negations),
            Err(ConditionError::TooDeep {
                max: MAX_CONDITION_DEPTH,
                offset: MAX_CONDITION_DEPTH,
            })
        );

        let parens = format!("{}a{}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(matches!(
            Condition::parse(&parens),
            Err(ConditionError::TooDeep { .. })
        ));

        let chain = vec!["a"; 10_000].join(" && ");
        assert!(matches!(
            Condition::parse(&chain),
            Err(ConditionError::TooDeep { .. })
        ));
    }

    #[test]
    fn test_nesting_up_to_limit_parses() {
        let agent = linux_x64();

        let negations = format!("{}gpu", "!".repeat(MAX_CONDITION_DEPTH));
        assert!(Condition::parse(&negations).unwrap().evaluate(&agent));

        let parens = format!(
            "{}os == linux{}",
            "(".repeat(MAX_CONDITION_DEPTH),
            ")".repeat(MAX_CONDITION_DEPTH)
        );
        assert!(Condition::parse(&parens).unwrap().evaluate(&agent));

        let alternatives = (0..20)
            .map(|i| format!("arch == a{i}"))
            .collect::<Vec<_>>()
            .join(" || ");
        assert!(!Condition::parse(&alternatives).unwrap().evaluate(&agent));
    }

    #[test]
    fn test_compiled_requirements_match_like_source() {
        let agent = linux_x64();
        let cases = [
            Requirements::default(),
            Requirements::default().with_condition("os == linux && gpu"),
            Requirements::default().with_condition("arch == arm64"),
            Requirements::default().with_resource("cpu", 16),
            Requirements::default().with_condition("os =="),
        ];

        for requirements in cases {
            let compiled = CompiledRequirements::compile(requirements.clone());
            assert_eq!(
                compiled.is_met_by(&agent),
                requirements.is_met_by(&agent),
                "requirements: {requirements:?}"
            );
        }

        let invalid = CompiledRequirements::compile(Requirements::default().with_condition("os =="));
        assert_eq!(
            invalid.condition_error(),
            Some(&ConditionError::UnexpectedEnd("a value"))
        );
    }

    #[test]
    fn test_requirements_deserialize_with_defaults() {
        let parsed: Requirements = serde_json::from_str(r#"{"condition":"arch == arm64"}"#).unwrap();
        assert_eq!(parsed.condition.as_deref(), Some("arch == arm64"));
        assert!(parsed.resources.is_empty());
        assert!(!parsed.exclusive);
    }
}
