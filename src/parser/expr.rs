//! Template expression AST and evaluator.
//!
//! Grammar:
//!
//! ```text
//! expr     := operand ( '|' filter )*
//! operand  := literal | ident accessor*
//! accessor := '.' ident | '[' int ']' | '[' quoted ']'
//! filter   := ident ( '(' literal ')' )?
//! ```

use serde_json::Value;

use super::TemplateContext;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path { root: String, segments: Vec<Segment> },
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub name: String,
    pub arg: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub operand: Operand,
    pub filters: Vec<Filter>,
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self> {
        let mut cursor = Cursor::new(src);
        let operand = cursor.operand()?;
        let mut filters = Vec::new();
        loop {
            cursor.skip_ws();
            if cursor.eat('|') {
                cursor.skip_ws();
                let name = cursor
                    .ident()
                    .ok_or_else(|| cursor.error("expected a filter name"))?;
                cursor.skip_ws();
                let arg = if cursor.eat('(') {
                    cursor.skip_ws();
                    let arg = cursor
                        .literal()?
                        .ok_or_else(|| cursor.error("expected a literal filter argument"))?;
                    cursor.skip_ws();
                    if !cursor.eat(')') {
                        return Err(cursor.error("expected `)`"));
                    }
                    Some(arg)
                } else {
                    None
                };
                filters.push(Filter { name, arg });
            } else if cursor.at_end() {
                break;
            } else {
                return Err(cursor.error("unexpected character"));
            }
        }
        Ok(Self { operand, filters })
    }

    /// Root identifier, for path operands.
    pub fn root(&self) -> Option<&str> {
        match &self.operand {
            Operand::Path { root, .. } => Some(root),
            Operand::Literal(_) => None,
        }
    }

    /// Name a value is formatted under by `as_arg`: the last key of the path.
    fn arg_name(&self) -> Option<String> {
        match &self.operand {
            Operand::Path { root, segments } => {
                let last_key = segments.iter().rev().find_map(|s| match s {
                    Segment::Key(k) if k != "value" => Some(k.clone()),
                    _ => None,
                });
                Some(last_key.unwrap_or_else(|| root.clone()))
            }
            Operand::Literal(_) => None,
        }
    }

    /// Evaluate; `Ok(None)` means a referent is not bound.
    pub fn eval(&self, ctx: &TemplateContext) -> Result<Option<Value>> {
        let mut value = match &self.operand {
            Operand::Literal(v) => Some(v.clone()),
            Operand::Path { root, segments } => ctx.get(root).and_then(|v| lookup(v, segments)),
        };
        for filter in &self.filters {
            value = match filter.name.as_str() {
                "default" => match value {
                    Some(v) if !v.is_null() => Some(v),
                    _ => Some(filter.arg.clone().unwrap_or(Value::Null)),
                },
                "as_arg" => match value {
                    Some(v) => {
                        let name = self.arg_name().ok_or_else(|| {
                            Error::Compiler("`as_arg` requires a named value".into())
                        })?;
                        Some(Value::String(ctx.format_arg(&name, &v)))
                    }
                    None => None,
                },
                "json" => value.map(|v| Value::String(v.to_string())),
                "str" => value.map(|v| Value::String(super::stringify(&v))),
                "upper" => value.map(|v| Value::String(super::stringify(&v).to_uppercase())),
                "lower" => value.map(|v| Value::String(super::stringify(&v).to_lowercase())),
                other => {
                    return Err(Error::Compiler(format!("unknown template filter `{}`", other)));
                }
            };
        }
        Ok(value)
    }
}

fn lookup(value: &Value, segments: &[Segment]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(i), Value::Array(items)) => {
                let idx = if *i < 0 { items.len() as i64 + i } else { *i };
                items.get(usize::try_from(idx).ok()?)?
            }
            (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src: src.trim(), pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::Compiler(format!(
            "invalid template expression `{}` at {}: {}",
            self.src, self.pos, msg
        ))
    }

    fn ident(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return None,
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Some(self.src[start..self.pos].to_string())
    }

    fn quoted(&mut self) -> Result<Option<String>> {
        let quote = match self.peek() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Ok(None),
        };
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(Some(out));
            }
            if c == '\\' {
                if let Some(escaped) = self.peek() {
                    self.pos += escaped.len_utf8();
                    out.push(escaped);
                    continue;
                }
            }
            out.push(c);
        }
        Err(self.error("unterminated string"))
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == digits_start {
            self.pos = start;
            return None;
        }
        let text = &self.src[start..self.pos];
        if let Ok(i) = text.parse::<i64>() {
            return Some(Value::from(i));
        }
        match text.parse::<f64>() {
            Ok(f) => Some(Value::from(f)),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    fn literal(&mut self) -> Result<Option<Value>> {
        if let Some(s) = self.quoted()? {
            return Ok(Some(Value::String(s)));
        }
        if let Some(n) = self.number() {
            return Ok(Some(n));
        }
        let save = self.pos;
        match self.ident().as_deref() {
            Some("true") | Some("True") => Ok(Some(Value::Bool(true))),
            Some("false") | Some("False") => Ok(Some(Value::Bool(false))),
            Some("null") | Some("None") | Some("none") => Ok(Some(Value::Null)),
            _ => {
                self.pos = save;
                Ok(None)
            }
        }
    }

    fn operand(&mut self) -> Result<Operand> {
        self.skip_ws();
        if let Some(literal) = self.literal()? {
            return Ok(Operand::Literal(literal));
        }
        let root = self
            .ident()
            .ok_or_else(|| self.error("expected an identifier or a literal"))?;
        let mut segments = Vec::new();
        loop {
            if self.eat('.') {
                let key = self
                    .ident()
                    .or_else(|| {
                        let start = self.pos;
                        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                            self.pos += 1;
                        }
                        (self.pos > start).then(|| self.src[start..self.pos].to_string())
                    })
                    .ok_or_else(|| self.error("expected a key after `.`"))?;
                segments.push(Segment::Key(key));
            } else if self.eat('[') {
                self.skip_ws();
                let segment = if let Some(key) = self.quoted()? {
                    Segment::Key(key)
                } else {
                    match self.number() {
                        Some(Value::Number(n)) if n.is_i64() => {
                            Segment::Index(n.as_i64().unwrap_or_default())
                        }
                        _ => return Err(self.error("expected an index or a quoted key")),
                    }
                };
                self.skip_ws();
                if !self.eat(']') {
                    return Err(self.error("expected `]`"));
                }
                segments.push(segment);
            } else {
                break;
            }
        }
        Ok(Operand::Path { root, segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_paths() {
        let expr = Expr::parse(" ops.A.outputs['loss'] ").unwrap();
        assert_eq!(expr.root(), Some("ops"));
        match expr.operand {
            Operand::Path { segments, .. } => {
                assert_eq!(segments.len(), 3);
                assert_eq!(segments[2], Segment::Key("loss".into()));
            }
            _ => panic!("Expected path"),
        }

        let expr = Expr::parse("items[0]").unwrap();
        match expr.operand {
            Operand::Path { segments, .. } => assert_eq!(segments[0], Segment::Index(0)),
            _ => panic!("Expected path"),
        }
    }

    #[test]
    fn test_parse_literals_and_filters() {
        let expr = Expr::parse("'hello'").unwrap();
        assert_eq!(expr.operand, Operand::Literal(json!("hello")));

        let expr = Expr::parse("lr | default(0.1) | as_arg").unwrap();
        assert_eq!(expr.filters.len(), 2);
        assert_eq!(expr.filters[0].arg, Some(json!(0.1)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("a.").is_err());
        assert!(Expr::parse("a[").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("'open").is_err());
    }

    #[test]
    fn test_eval() {
        let mut ctx = TemplateContext::new();
        ctx.insert("globals.uuid", json!("abc"));
        ctx.insert("data", json!({"items": [1, 2, 3]}));

        let v = Expr::parse("globals.uuid").unwrap().eval(&ctx).unwrap();
        assert_eq!(v, Some(json!("abc")));
        let v = Expr::parse("data.items[-1]").unwrap().eval(&ctx).unwrap();
        assert_eq!(v, Some(json!(3)));
        let v = Expr::parse("missing.key").unwrap().eval(&ctx).unwrap();
        assert_eq!(v, None);
        let v = Expr::parse("missing | default('x')").unwrap().eval(&ctx).unwrap();
        assert_eq!(v, Some(json!("x")));
        let v = Expr::parse("data | json").unwrap().eval(&ctx).unwrap();
        assert_eq!(v, Some(json!(r#"{"items":[1,2,3]}"#)));
        assert!(Expr::parse("data | nope").unwrap().eval(&ctx).is_err());
    }
}
