//! Guard expressions for declarative conditions and permissions.
//!
//! Guards are boolean expressions over the entity's fields and, for
//! permissions, the caller's attributes:
//!
//! - `ctx.field` - entity field is truthy
//! - `ctx.field.nested` - nested field access
//! - `user.attr` - caller attribute is truthy (permissions only)
//! - `ctx.field == value` / `!=` - equality (strings, numbers, booleans, null)
//! - `ctx.field > value` / `>=` / `<` / `<=` - numeric comparison
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping
//!
//! Examples:
//! - `ctx.is_available`
//! - `ctx.amount > 100 && !ctx.disputed`
//! - `user.is_staff || ctx.owner_id == "u-1"`

use crate::entity::{is_truthy, Caller, Entity};
use crate::error::EngineError;
use serde_json::{Map, Value};

/// Which object a field path reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    /// The entity's fields.
    Ctx,
    /// The caller's attributes.
    User,
}

/// A field path such as `ctx.order.paid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub root: Root,
    pub path: Vec<String>,
}

/// Values a guard reads from.
pub struct Scope<'a> {
    entity: &'a Entity,
    caller: Option<&'a Caller>,
}

impl<'a> Scope<'a> {
    pub fn new(entity: &'a Entity, caller: Option<&'a Caller>) -> Self {
        Self { entity, caller }
    }

    fn resolve(&self, field: &FieldRef) -> Value {
        let map: &Map<String, Value> = match field.root {
            Root::Ctx => &self.entity.fields,
            Root::User => match self.caller {
                Some(caller) => &caller.attributes,
                None => return Value::Null,
            },
        };

        let mut parts = field.path.iter();
        let mut current = match parts.next().and_then(|first| map.get(first)) {
            Some(value) => value,
            None => return Value::Null,
        };
        for part in parts {
            match current {
                Value::Object(inner) => {
                    current = inner.get(part).unwrap_or(&Value::Null);
                }
                _ => return Value::Null,
            }
        }
        current.clone()
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone)]
pub enum GuardExpr {
    /// Field is truthy.
    Truthy(FieldRef),
    /// Equality comparison.
    Eq(FieldRef, Value),
    /// Inequality comparison.
    Ne(FieldRef, Value),
    /// Greater than.
    Gt(FieldRef, f64),
    /// Greater or equal.
    Ge(FieldRef, f64),
    /// Less than.
    Lt(FieldRef, f64),
    /// Less or equal.
    Le(FieldRef, f64),
    /// Logical AND.
    And(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical OR.
    Or(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical NOT.
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EngineError::InvalidGuard {
                reason: "empty guard expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(EngineError::InvalidGuard {
                reason: format!("unexpected input at position {}", parser.pos),
            });
        }
        Ok(expr)
    }

    /// Evaluates the guard.
    pub fn evaluate(&self, scope: &Scope<'_>) -> bool {
        match self {
            GuardExpr::Truthy(field) => is_truthy(&scope.resolve(field)),
            GuardExpr::Eq(field, expected) => values_equal(&scope.resolve(field), expected),
            GuardExpr::Ne(field, expected) => !values_equal(&scope.resolve(field), expected),
            GuardExpr::Gt(field, expected) => compare(scope, field, |v| v > *expected),
            GuardExpr::Ge(field, expected) => compare(scope, field, |v| v >= *expected),
            GuardExpr::Lt(field, expected) => compare(scope, field, |v| v < *expected),
            GuardExpr::Le(field, expected) => compare(scope, field, |v| v <= *expected),
            GuardExpr::And(left, right) => left.evaluate(scope) && right.evaluate(scope),
            GuardExpr::Or(left, right) => left.evaluate(scope) || right.evaluate(scope),
            GuardExpr::Not(inner) => !inner.evaluate(scope),
        }
    }

    /// Returns true if any field path reads from the caller.
    pub fn references_user(&self) -> bool {
        match self {
            GuardExpr::Truthy(f)
            | GuardExpr::Eq(f, _)
            | GuardExpr::Ne(f, _)
            | GuardExpr::Gt(f, _)
            | GuardExpr::Ge(f, _)
            | GuardExpr::Lt(f, _)
            | GuardExpr::Le(f, _) => f.root == Root::User,
            GuardExpr::And(l, r) | GuardExpr::Or(l, r) => l.references_user() || r.references_user(),
            GuardExpr::Not(inner) => inner.references_user(),
        }
    }
}

fn compare(scope: &Scope<'_>, field: &FieldRef, op: impl Fn(f64) -> bool) -> bool {
    match scope.resolve(field) {
        Value::Number(n) => n.as_f64().map(op).unwrap_or(false),
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

/// Recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, EngineError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, EngineError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, EngineError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, EngineError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, EngineError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(invalid("expected ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, EngineError> {
        let field = self.parse_field()?;
        self.skip_whitespace();

        if self.peek_str("==") {
            self.pos += 2;
            return Ok(GuardExpr::Eq(field, self.parse_value()?));
        }
        if self.peek_str("!=") {
            self.pos += 2;
            return Ok(GuardExpr::Ne(field, self.parse_value()?));
        }
        if self.peek_str(">=") {
            self.pos += 2;
            return Ok(GuardExpr::Ge(field, self.parse_number()?));
        }
        if self.peek_str("<=") {
            self.pos += 2;
            return Ok(GuardExpr::Le(field, self.parse_number()?));
        }
        if self.peek_char() == Some('>') {
            self.pos += 1;
            return Ok(GuardExpr::Gt(field, self.parse_number()?));
        }
        if self.peek_char() == Some('<') {
            self.pos += 1;
            return Ok(GuardExpr::Lt(field, self.parse_number()?));
        }

        Ok(GuardExpr::Truthy(field))
    }

    fn parse_field(&mut self) -> Result<FieldRef, EngineError> {
        let root = if self.peek_str("ctx.") {
            self.pos += 4;
            Root::Ctx
        } else if self.peek_str("user.") {
            self.pos += 5;
            Root::User
        } else {
            return Err(invalid("field must start with 'ctx.' or 'user.'"));
        };

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let raw = &self.input[start..self.pos];
        let path: Vec<String> = raw.split('.').map(str::to_string).collect();
        if path.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty field name"));
        }

        Ok(FieldRef { root, path })
    }

    fn parse_value(&mut self) -> Result<Value, EngineError> {
        self.skip_whitespace();
        let rest = &self.input[self.pos..];

        if rest.starts_with("true") {
            self.pos += 4;
            return Ok(Value::Bool(true));
        }
        if rest.starts_with("false") {
            self.pos += 5;
            return Ok(Value::Bool(false));
        }
        if rest.starts_with("null") {
            self.pos += 4;
            return Ok(Value::Null);
        }
        if rest.starts_with('"') {
            return self.parse_string_value();
        }

        let num = self.parse_number()?;
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("number out of range: {}", num)))
    }

    fn parse_string_value(&mut self) -> Result<Value, EngineError> {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '"' {
                let s = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(Value::String(s.to_string()));
            }
            self.pos += c.len_utf8();
        }

        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, EngineError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid number: '{}'", num_str)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidGuard {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(fields: Value) -> Entity {
        let mut entity = Entity::new("invoice", "inv-1");
        if let Value::Object(map) = fields {
            entity.fields = map;
        }
        entity
    }

    fn eval(expr: &str, fields: Value) -> bool {
        let entity = entity(fields);
        GuardExpr::parse(expr).unwrap().evaluate(&Scope::new(&entity, None))
    }

    #[test]
    fn test_truthy_check() {
        assert!(eval("ctx.is_available", json!({"is_available": true})));
        assert!(!eval("ctx.is_available", json!({"is_available": false})));
        assert!(!eval("ctx.is_available", json!({"is_available": null})));
        assert!(!eval("ctx.is_available", json!({})));
    }

    #[test]
    fn test_equality() {
        assert!(eval("ctx.status == \"draft\"", json!({"status": "draft"})));
        assert!(!eval("ctx.status == \"draft\"", json!({"status": "paid"})));
        assert!(eval("ctx.status != \"void\"", json!({"status": "paid"})));
        assert!(eval("ctx.count == 42", json!({"count": 42})));
        assert!(eval("ctx.flag == false", json!({"flag": false})));
        assert!(eval("ctx.owner == null", json!({"owner": null})));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(eval("ctx.amount > 100", json!({"amount": 150})));
        assert!(!eval("ctx.amount > 100", json!({"amount": 100})));
        assert!(eval("ctx.amount >= 100", json!({"amount": 100})));
        assert!(eval("ctx.temp < -10", json!({"temp": -15})));
        assert!(eval("ctx.rate <= 0.5", json!({"rate": 0.5})));
        assert!(!eval("ctx.amount > 10", json!({"amount": "lots"})));
    }

    #[test]
    fn test_logic_and_precedence() {
        assert!(eval("ctx.a && ctx.b || ctx.c", json!({"a": false, "b": false, "c": true})));
        assert!(!eval("ctx.a && (ctx.b || ctx.c)", json!({"a": false, "b": true, "c": true})));
        assert!(eval("!(ctx.a && ctx.b)", json!({"a": true, "b": false})));
        assert!(eval("!!ctx.a", json!({"a": true})));
    }

    #[test]
    fn test_nested_field() {
        assert!(eval("ctx.order.customer.verified", json!({"order": {"customer": {"verified": true}}})));
        assert!(!eval("ctx.order.customer.verified", json!({"order": {}})));
    }

    #[test]
    fn test_user_root() {
        let lock = entity(json!({"status": "open"}));
        let staff = Caller::new("u-1").with_attribute("is_staff", true);
        let customer = Caller::new("u-2");

        let guard = GuardExpr::parse("user.is_staff").unwrap();
        assert!(guard.references_user());
        assert!(guard.evaluate(&Scope::new(&lock, Some(&staff))));
        assert!(!guard.evaluate(&Scope::new(&lock, Some(&customer))));
        assert!(!guard.evaluate(&Scope::new(&lock, None)));

        let guard = GuardExpr::parse("!user.is_staff && ctx.status == \"open\"").unwrap();
        assert!(guard.references_user());
        assert!(guard.evaluate(&Scope::new(&lock, Some(&customer))));

        assert!(!GuardExpr::parse("ctx.status").unwrap().references_user());
    }

    #[test]
    fn test_parse_errors() {
        assert!(GuardExpr::parse("").is_err());
        assert!(GuardExpr::parse("   ").is_err());
        assert!(GuardExpr::parse("foo.bar").is_err());
        assert!(GuardExpr::parse("ctx.").is_err());
        assert!(GuardExpr::parse("ctx.a..b").is_err());
        assert!(GuardExpr::parse("(ctx.a && ctx.b").is_err());
        assert!(GuardExpr::parse("ctx.name == \"unclosed").is_err());
        assert!(GuardExpr::parse("ctx.value > abc").is_err());
        assert!(GuardExpr::parse("ctx.a ctx.b").is_err());
    }
}
