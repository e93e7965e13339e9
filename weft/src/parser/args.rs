//! Argument list grammar: `name=value, ...` up to the closing `)`.
//!
//! Values: quoted strings (single or double quotes, backslash escapes), numbers,
//! `true/false/null` (and `True/False/None`), lists `[..]`, tuples `(..)` read as lists,
//! maps `{"k": v}`, and references `$N` / `${N}`. Inside a string only `${N}` is a reference.

use serde_json::{Number, Value};

use crate::task::{ArgValue, Arguments, TaskIndex};

/// Deepest container nesting accepted in one argument value.
pub(crate) const MAX_NESTING: usize = 32;

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, want: char) -> bool {
        if self.peek() == Some(want) {
            self.pos += want.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn identifier(&mut self) -> Option<&'a str> {
        match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' => {
                Some(self.take_while(|c| c.is_alphanumeric() || c == '_'))
            }
            _ => None,
        }
    }
}

/// Parses arguments starting just after the opening `(`.
///
/// Returns the arguments and whatever follows the matching `)`.
pub(crate) fn parse_call_arguments(src: &str) -> Result<(Arguments, &str), String> {
    let mut cur = Cursor::new(src);
    let mut args = Arguments::new();
    loop {
        cur.skip_ws();
        if cur.eat(')') {
            return Ok((args, cur.rest()));
        }
        let name = cur
            .identifier()
            .ok_or_else(|| format!("expected argument name at `{}`", snippet(cur.rest())))?;
        cur.skip_ws();
        if !cur.eat('=') {
            return Err(format!("expected `=` after argument `{}`", name));
        }
        cur.skip_ws();
        let value = parse_value(&mut cur, 0)?;
        if args.get(name).is_some() {
            return Err(format!("duplicate argument `{}`", name));
        }
        args.push(name, value);
        cur.skip_ws();
        if cur.eat(',') {
            continue;
        }
        if cur.eat(')') {
            return Ok((args, cur.rest()));
        }
        return Err(match cur.peek() {
            Some(c) => format!("unexpected `{}` after argument `{}`", c, name),
            None => "unterminated argument list".to_string(),
        });
    }
}

fn snippet(s: &str) -> String {
    s.chars().take(16).collect()
}

fn parse_value(cur: &mut Cursor<'_>, depth: usize) -> Result<ArgValue, String> {
    if depth >= MAX_NESTING {
        return Err("value nested too deeply".to_string());
    }
    match cur.peek() {
        Some(q @ ('"' | '\'')) => {
            cur.bump();
            parse_string(cur, q).map(ArgValue::string)
        }
        Some('$') => parse_reference(cur).map(ArgValue::Reference),
        Some('[') => {
            cur.bump();
            parse_sequence(cur, ']', depth + 1)
        }
        Some('(') => {
            cur.bump();
            parse_sequence(cur, ')', depth + 1)
        }
        Some('{') => {
            cur.bump();
            parse_map(cur, depth + 1)
        }
        Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => parse_number(cur),
        Some(c) if c.is_alphabetic() || c == '_' => {
            let word = cur.identifier().unwrap_or_default();
            match word {
                "true" | "True" => Ok(ArgValue::Literal(Value::Bool(true))),
                "false" | "False" => Ok(ArgValue::Literal(Value::Bool(false))),
                "null" | "None" => Ok(ArgValue::Literal(Value::Null)),
                other => Err(format!("unquoted value `{}`", other)),
            }
        }
        Some(c) => Err(format!("unexpected `{}` in value", c)),
        None => Err("missing value".to_string()),
    }
}

fn parse_string(cur: &mut Cursor<'_>, quote: char) -> Result<String, String> {
    let mut out = String::new();
    loop {
        match cur.bump() {
            None => return Err("unterminated string".to_string()),
            Some(c) if c == quote => return Ok(out),
            Some('\\') => match cur.bump() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some('u') => {
                    let hex: String = (0..4).filter_map(|_| cur.bump()).collect();
                    let c = u32::from_str_radix(&hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| format!("bad unicode escape `\\u{}`", hex))?;
                    out.push(c);
                }
                Some(c @ ('\\' | '"' | '\'')) => out.push(c),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return Err("unterminated string".to_string()),
            },
            Some(c) => out.push(c),
        }
    }
}

fn parse_reference(cur: &mut Cursor<'_>) -> Result<TaskIndex, String> {
    cur.bump();
    let braced = cur.eat('{');
    let digits = cur.take_while(|c| c.is_ascii_digit());
    if digits.is_empty() {
        return Err("`$` must be followed by a task index".to_string());
    }
    if braced && !cur.eat('}') {
        return Err("unclosed `${`".to_string());
    }
    digits
        .parse::<TaskIndex>()
        .map_err(|e| format!("bad task index `{}`: {}", digits, e))
}

fn parse_number(cur: &mut Cursor<'_>) -> Result<ArgValue, String> {
    let text = cur.take_while(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E' | '_'));
    let cleaned = text.replace('_', "");
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if let Ok(i) = cleaned.parse::<i64>() {
        return Ok(ArgValue::Literal(Value::Number(i.into())));
    }
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(|n| ArgValue::Literal(Value::Number(n)))
        .ok_or_else(|| format!("bad number `{}`", text))
}

/// Lists and maps holding only literals collapse into a single JSON literal.
fn collapse_list(items: Vec<ArgValue>) -> ArgValue {
    if items.iter().all(|v| matches!(v, ArgValue::Literal(_))) {
        let values = items
            .into_iter()
            .filter_map(|v| match v {
                ArgValue::Literal(v) => Some(v),
                _ => None,
            })
            .collect();
        ArgValue::Literal(Value::Array(values))
    } else {
        ArgValue::List(items)
    }
}

fn collapse_map(entries: Vec<(String, ArgValue)>) -> ArgValue {
    if entries.iter().all(|(_, v)| matches!(v, ArgValue::Literal(_))) {
        let map = entries
            .into_iter()
            .filter_map(|(k, v)| match v {
                ArgValue::Literal(v) => Some((k, v)),
                _ => None,
            })
            .collect();
        ArgValue::Literal(Value::Object(map))
    } else {
        ArgValue::Map(entries)
    }
}

fn parse_sequence(cur: &mut Cursor<'_>, close: char, depth: usize) -> Result<ArgValue, String> {
    let mut items = Vec::new();
    loop {
        cur.skip_ws();
        if cur.eat(close) {
            return Ok(collapse_list(items));
        }
        items.push(parse_value(cur, depth)?);
        cur.skip_ws();
        if cur.eat(',') {
            continue;
        }
        if cur.eat(close) {
            return Ok(collapse_list(items));
        }
        return Err(format!("expected `,` or `{}` in list", close));
    }
}

fn parse_map(cur: &mut Cursor<'_>, depth: usize) -> Result<ArgValue, String> {
    let mut entries: Vec<(String, ArgValue)> = Vec::new();
    loop {
        cur.skip_ws();
        if cur.eat('}') {
            return Ok(collapse_map(entries));
        }
        let key = match cur.peek() {
            Some(q @ ('"' | '\'')) => {
                cur.bump();
                parse_string(cur, q)?
            }
            _ => cur
                .identifier()
                .map(str::to_string)
                .ok_or_else(|| "expected map key".to_string())?,
        };
        cur.skip_ws();
        if !cur.eat(':') {
            return Err(format!("expected `:` after map key `{}`", key));
        }
        cur.skip_ws();
        let value = parse_value(cur, depth)?;
        entries.push((key, value));
        cur.skip_ws();
        if cur.eat(',') {
            continue;
        }
        if cur.eat('}') {
            return Ok(collapse_map(entries));
        }
        return Err("expected `,` or `}` in map".to_string());
    }
}
