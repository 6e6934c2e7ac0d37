//! State and metrics predicates.
//!
//! State expressions are evaluated against the classifier view of the
//! current round only; repeat semantics come from the caller re-evaluating
//! each round. Metrics expressions are alert rules registered with the
//! external alert source.

use std::fmt;
use std::time::Duration;

use crate::classifier::ClassifierReader;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unexpected token {found:?}, expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },
    #[error("unexpected end of expression, expected {expected}")]
    UnexpectedEnd { expected: &'static str },
    #[error("unknown selector {found:?}")]
    UnknownSelector { found: String },
    #[error("trailing input after expression: {rest:?}")]
    TrailingInput { rest: String },
    #[error("number {found:?} does not fit")]
    BadNumber { found: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    Pending,
    Running,
    Successful,
    Failed,
    Total,
}

impl CountKind {
    fn read(&self, view: &dyn ClassifierReader) -> i64 {
        let count = match self {
            CountKind::Pending => view.num_pending_jobs(),
            CountKind::Running => view.num_running_jobs(),
            CountKind::Successful => view.num_successful_jobs(),
            CountKind::Failed => view.num_failed_jobs(),
            CountKind::Total => view.num_all_jobs(),
        };
        count as i64
    }

    fn as_str(&self) -> &'static str {
        match self {
            CountKind::Pending => "pending()",
            CountKind::Running => "running()",
            CountKind::Successful => "successful()",
            CountKind::Failed => "failed()",
            CountKind::Total => "total()",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(&self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    Count(CountKind),
    Literal(i64),
}

impl Term {
    fn read(&self, view: &dyn ClassifierReader) -> i64 {
        match self {
            Term::Count(kind) => kind.read(view),
            Term::Literal(value) => *value,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Count(kind) => write!(f, "{}", kind.as_str()),
            Term::Literal(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    IsRunning,
    IsSuccessful,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateExpr {
    Or(Box<StateExpr>, Box<StateExpr>),
    And(Box<StateExpr>, Box<StateExpr>),
    Cmp { lhs: Term, op: CmpOp, rhs: Term },
    Probe { probe: ProbeKind, target: String },
}

/// Result of evaluating a state expression against one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub info: String,
    pub fired: bool,
}

impl StateExpr {
    pub fn eval(&self, view: &dyn ClassifierReader) -> Evaluation {
        let fired = self.fired(view);
        Evaluation {
            info: self.describe(view),
            fired,
        }
    }

    fn fired(&self, view: &dyn ClassifierReader) -> bool {
        match self {
            StateExpr::Or(lhs, rhs) => lhs.fired(view) || rhs.fired(view),
            StateExpr::And(lhs, rhs) => lhs.fired(view) && rhs.fired(view),
            StateExpr::Cmp { lhs, op, rhs } => op.apply(lhs.read(view), rhs.read(view)),
            StateExpr::Probe { probe, target } => match probe {
                ProbeKind::IsRunning => view.is_running(target),
                ProbeKind::IsSuccessful => view.is_successful(target),
            },
        }
    }

    fn describe(&self, view: &dyn ClassifierReader) -> String {
        match self {
            StateExpr::Or(lhs, rhs) => {
                format!("({}) || ({})", lhs.describe(view), rhs.describe(view))
            }
            StateExpr::And(lhs, rhs) => {
                format!("({}) && ({})", lhs.describe(view), rhs.describe(view))
            }
            StateExpr::Cmp { lhs, op, rhs } => format!(
                "{} {} {} [{} vs {}]",
                lhs,
                op.as_str(),
                rhs,
                lhs.read(view),
                rhs.read(view)
            ),
            StateExpr::Probe { probe, target } => match probe {
                ProbeKind::IsRunning => {
                    format!("is_running({target}) [{}]", view.is_running(target))
                }
                ProbeKind::IsSuccessful => {
                    format!("is_successful({target}) [{}]", view.is_successful(target))
                }
            },
        }
    }
}

/// Parse-only check used by the plan validator.
pub fn validate_state_expr(expr: &str) -> Result<(), ExprError> {
    parse_state_expr(expr).map(|_| ())
}

pub fn parse_state_expr(expr: &str) -> Result<StateExpr, ExprError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let parsed = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(ExprError::TrailingInput {
            rest: token.describe(),
        });
    }
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(i64),
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Op(CmpOp),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => name.clone(),
            Token::Number(value) => value.to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::AndAnd => "&&".to_string(),
            Token::OrOr => "||".to_string(),
            Token::Op(op) => op.as_str().to_string(),
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
                let text = &expr[start..i];
                let value = text
                    .parse::<i64>()
                    .map_err(|_| ExprError::BadNumber {
                        found: text.to_string(),
                    })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(expr[start..i].to_string()));
            }
            other => {
                return Err(ExprError::UnexpectedChar {
                    found: other,
                    offset: i,
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &'static str) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken {
                found: token.describe(),
                expected: what,
            }),
            None => Err(ExprError::UnexpectedEnd { expected: what }),
        }
    }

    fn parse_or(&mut self) -> Result<StateExpr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = StateExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<StateExpr, ExprError> {
        let mut lhs = self.parse_atom()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let rhs = self.parse_atom()?;
            lhs = StateExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_atom(&mut self) -> Result<StateExpr, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            // Either a grouped expression or a literal on the left of a
            // comparison; groups always start with a selector or paren.
            self.next();
            let inner = self.parse_or()?;
            self.expect(Token::RParen, "closing parenthesis")?;
            return Ok(inner);
        }

        match self.next() {
            Some(Token::Ident(name)) => self.parse_selector(name),
            Some(Token::Number(value)) => self.parse_cmp(Term::Literal(value)),
            Some(token) => Err(ExprError::UnexpectedToken {
                found: token.describe(),
                expected: "selector, probe, or number",
            }),
            None => Err(ExprError::UnexpectedEnd {
                expected: "selector, probe, or number",
            }),
        }
    }

    fn parse_selector(&mut self, name: String) -> Result<StateExpr, ExprError> {
        match name.as_str() {
            "pending" | "running" | "successful" | "failed" | "total" => {
                self.expect(Token::LParen, "opening parenthesis")?;
                self.expect(Token::RParen, "closing parenthesis")?;
                let kind = match name.as_str() {
                    "pending" => CountKind::Pending,
                    "running" => CountKind::Running,
                    "successful" => CountKind::Successful,
                    "failed" => CountKind::Failed,
                    _ => CountKind::Total,
                };
                self.parse_cmp(Term::Count(kind))
            }
            "is_running" | "is_successful" => {
                self.expect(Token::LParen, "opening parenthesis")?;
                let target = match self.next() {
                    Some(Token::Ident(target)) => target,
                    Some(token) => {
                        return Err(ExprError::UnexpectedToken {
                            found: token.describe(),
                            expected: "job name",
                        })
                    }
                    None => return Err(ExprError::UnexpectedEnd { expected: "job name" }),
                };
                self.expect(Token::RParen, "closing parenthesis")?;
                let probe = if name == "is_running" {
                    ProbeKind::IsRunning
                } else {
                    ProbeKind::IsSuccessful
                };
                Ok(StateExpr::Probe { probe, target })
            }
            _ => Err(ExprError::UnknownSelector { found: name }),
        }
    }

    fn parse_cmp(&mut self, lhs: Term) -> Result<StateExpr, ExprError> {
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            Some(token) => {
                return Err(ExprError::UnexpectedToken {
                    found: token.describe(),
                    expected: "comparison operator",
                })
            }
            None => {
                return Err(ExprError::UnexpectedEnd {
                    expected: "comparison operator",
                })
            }
        };

        let rhs = match self.next() {
            Some(Token::Number(value)) => Term::Literal(value),
            Some(Token::Ident(name)) => match name.as_str() {
                "pending" | "running" | "successful" | "failed" | "total" => {
                    self.expect(Token::LParen, "opening parenthesis")?;
                    self.expect(Token::RParen, "closing parenthesis")?;
                    let kind = match name.as_str() {
                        "pending" => CountKind::Pending,
                        "running" => CountKind::Running,
                        "successful" => CountKind::Successful,
                        "failed" => CountKind::Failed,
                        _ => CountKind::Total,
                    };
                    Term::Count(kind)
                }
                _ => return Err(ExprError::UnknownSelector { found: name }),
            },
            Some(token) => {
                return Err(ExprError::UnexpectedToken {
                    found: token.describe(),
                    expected: "selector or number",
                })
            }
            None => {
                return Err(ExprError::UnexpectedEnd {
                    expected: "selector or number",
                })
            }
        };

        Ok(StateExpr::Cmp { lhs, op, rhs })
    }
}

/// How an alert rule folds the sampled series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertReducer {
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertCondition {
    Below(f64),
    Above(f64),
}

/// A metrics alert rule: `avg() of query(<panel>, <window>, now) is
/// below(<threshold>)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub reducer: AlertReducer,
    pub panel: String,
    pub window: Duration,
    pub condition: AlertCondition,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AlertExprError {
    #[error("alert expression must look like 'avg() of query(<panel>, <window>, now) is below(<n>)', got {found:?}")]
    Malformed { found: String },
    #[error("unknown alert reducer {found:?}")]
    UnknownReducer { found: String },
    #[error("unknown alert condition {found:?}")]
    UnknownCondition { found: String },
    #[error("bad alert window {found:?}")]
    BadWindow { found: String },
    #[error("bad alert threshold {found:?}")]
    BadThreshold { found: String },
}

/// Parse-only check used by the plan validator.
pub fn validate_alert_expr(expr: &str) -> Result<(), AlertExprError> {
    parse_alert_expr(expr).map(|_| ())
}

pub fn parse_alert_expr(expr: &str) -> Result<AlertRule, AlertExprError> {
    let malformed = || AlertExprError::Malformed {
        found: expr.to_string(),
    };

    let (reducer_part, rest) = expr.trim().split_once(" of ").ok_or_else(malformed)?;
    let reducer = match reducer_part.trim() {
        "avg()" => AlertReducer::Avg,
        other => {
            return Err(AlertExprError::UnknownReducer {
                found: other.to_string(),
            })
        }
    };

    let (query_part, condition_part) = rest.split_once(" is ").ok_or_else(malformed)?;

    let query_args = query_part
        .trim()
        .strip_prefix("query(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(malformed)?;
    let args: Vec<&str> = query_args.split(',').map(str::trim).collect();
    let [panel, window, origin] = args.as_slice() else {
        return Err(malformed());
    };
    if *origin != "now" || panel.is_empty() {
        return Err(malformed());
    }

    let window = parse_window(window)?;

    let condition_part = condition_part.trim();
    let (kind, threshold) = condition_part
        .split_once('(')
        .and_then(|(kind, rest)| rest.strip_suffix(')').map(|t| (kind, t)))
        .ok_or_else(malformed)?;
    let threshold: f64 = threshold
        .trim()
        .parse()
        .map_err(|_| AlertExprError::BadThreshold {
            found: threshold.to_string(),
        })?;
    let condition = match kind.trim() {
        "below" => AlertCondition::Below(threshold),
        "above" => AlertCondition::Above(threshold),
        other => {
            return Err(AlertExprError::UnknownCondition {
                found: other.to_string(),
            })
        }
    };

    Ok(AlertRule {
        reducer,
        panel: panel.to_string(),
        window,
        condition,
    })
}

fn parse_window(window: &str) -> Result<Duration, AlertExprError> {
    let bad = || AlertExprError::BadWindow {
        found: window.to_string(),
    };

    let digits: String = window.chars().take_while(|c| c.is_ascii_digit()).collect();
    let unit = &window[digits.len()..];
    let value: u64 = digits.parse().map_err(|_| bad())?;

    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return Err(bad()),
    };

    Ok(Duration::from_secs(secs))
}
