//! Expression language for computed fields: parse once at registration, evaluate per row.

use serde_json::{Number, Value};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Concat,
    Upper,
    Lower,
    Trim,
    Len,
    Round,
    Floor,
    Ceil,
    Abs,
    Min,
    Max,
    Coalesce,
    If,
}

impl Function {
    fn from_name(name: &str) -> Option<Function> {
        Some(match name.to_ascii_lowercase().as_str() {
            "concat" => Function::Concat,
            "upper" => Function::Upper,
            "lower" => Function::Lower,
            "trim" => Function::Trim,
            "len" | "length" => Function::Len,
            "round" => Function::Round,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "abs" => Function::Abs,
            "min" => Function::Min,
            "max" => Function::Max,
            "coalesce" => Function::Coalesce,
            "if" => Function::If,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    UnknownField(String),
    DivisionByZero,
    TypeMismatch(String),
    Arity(&'static str),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::UnknownField(n) => write!(f, "unknown field '{}'", n),
            EvalError::DivisionByZero => write!(f, "division by zero"),
            EvalError::TypeMismatch(m) => write!(f, "type mismatch: {}", m),
            EvalError::Arity(func) => write!(f, "wrong number of arguments to {}", func),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
}

const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map(|d| d.is_ascii_digit()).unwrap_or(false)) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text.parse::<f64>().map_err(|_| format!("bad number '{}'", text))?;
            tokens.push(Token::Number(n));
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string".into()),
                    Some('\\') => {
                        if let Some(&next) = chars.get(i + 1) {
                            s.push(match next {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        } else {
                            return Err("unterminated string".into());
                        }
                    }
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        s.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '{' {
            let braced = c == '{';
            if braced {
                i += 1;
                while chars.get(i) == Some(&'{') {
                    i += 1;
                }
            }
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            if braced {
                let mut closed = false;
                while chars.get(i) == Some(&'}') {
                    i += 1;
                    closed = true;
                }
                if !closed || name.is_empty() {
                    return Err("unterminated field reference".into());
                }
            }
            if name.is_empty() {
                return Err(format!("unexpected character '{}'", c));
            }
            tokens.push(Token::Ident(name));
            continue;
        }
        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            '?' => tokens.push(Token::Question),
            ':' => tokens.push(Token::Colon),
            _ => {
                let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| format!("unexpected character '{}'", c))?;
                tokens.push(Token::Op(*op));
                i += op.len();
                continue;
            }
        }
        i += 1;
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", token, t)),
            None => Err(format!("expected {:?}, found end of input", token)),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let cond = self.or()?;
        if self.peek() == Some(&Token::Question) {
            self.pos += 1;
            let then = self.expr()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expr()?;
            return Ok(Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    fn binary_level(
        &mut self,
        ops: &[&str],
        next: fn(&mut Parser) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        let mut lhs = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let rhs = next(self)?;
            lhs = Expr::Binary(binary_op(op), Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, String> {
        self.binary_level(&["||"], Parser::and)
    }

    fn and(&mut self) -> Result<Expr, String> {
        self.binary_level(&["&&"], Parser::equality)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        self.binary_level(&["==", "===", "!=", "!=="], Parser::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        self.binary_level(&["<", "<=", ">", ">="], Parser::additive)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        self.binary_level(&["+", "-"], Parser::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(&["*", "/", "%"], Parser::unary)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if let Some(op) = self.eat_op(&["-", "!"]) {
            let inner = self.unary()?;
            let op = if op == "-" { UnaryOp::Neg } else { UnaryOp::Not };
            return Ok(Expr::Unary(op, Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let e = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    let func = Function::from_name(&name).ok_or_else(|| format!("unknown function '{}'", name))?;
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(func, args))
                }
                _ => Ok(Expr::Field(name)),
            },
            Some(t) => Err(format!("unexpected token {:?}", t)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

fn binary_op(op: &str) -> BinaryOp {
    match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        "==" | "===" => BinaryOp::Eq,
        "!=" | "!==" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "&&" => BinaryOp::And,
        _ => BinaryOp::Or,
    }
}

/// Integral results come back as JSON integers, everything else as floats.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) if !a.is_string() || !b.is_string() => x == y,
        _ => a == b,
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, String> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err("empty expression".into());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(t) = parser.peek() {
            return Err(format!("unexpected trailing token {:?}", t));
        }
        Ok(expr)
    }

    /// Field names referenced anywhere in the expression.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Field(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Unary(_, e) => e.collect_fields(out),
            Expr::Binary(_, l, r) => {
                l.collect_fields(out);
                r.collect_fields(out);
            }
            Expr::Conditional(c, t, o) => {
                c.collect_fields(out);
                t.collect_fields(out);
                o.collect_fields(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_fields(out)),
        }
    }

    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(name) => lookup(name).ok_or_else(|| EvalError::UnknownField(name.clone())),
            Expr::Unary(op, inner) => {
                let v = inner.eval(lookup)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                    UnaryOp::Neg if v.is_null() => Ok(Value::Null),
                    UnaryOp::Neg => as_number(&v)
                        .map(|n| number(-n))
                        .ok_or_else(|| EvalError::TypeMismatch(format!("cannot negate {}", v))),
                }
            }
            Expr::Binary(BinaryOp::And, l, r) => {
                let lv = l.eval(lookup)?;
                if !truthy(&lv) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&r.eval(lookup)?)))
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                let lv = l.eval(lookup)?;
                if truthy(&lv) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&r.eval(lookup)?)))
            }
            Expr::Binary(op, l, r) => {
                let lv = l.eval(lookup)?;
                let rv = r.eval(lookup)?;
                binary(*op, &lv, &rv)
            }
            Expr::Conditional(c, t, o) => {
                if truthy(&c.eval(lookup)?) {
                    t.eval(lookup)
                } else {
                    o.eval(lookup)
                }
            }
            Expr::Call(func, args) => call(*func, args, lookup),
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(loosely_equal(l, r))),
        BinaryOp::Ne => return Ok(Value::Bool(!loosely_equal(l, r))),
        _ => {}
    }
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if op == BinaryOp::Add && (l.is_string() || r.is_string()) {
        return Ok(Value::String(format!("{}{}", display(l), display(r))));
    }
    if matches!(op, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge) {
        if let (Value::String(a), Value::String(b)) = (l, r) {
            let ord = a.cmp(b);
            return Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }));
        }
    }
    let (a, b) = match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(EvalError::TypeMismatch(format!("{} and {} are not both numbers", l, r))),
    };
    Ok(match op {
        BinaryOp::Add => number(a + b),
        BinaryOp::Sub => number(a - b),
        BinaryOp::Mul => number(a * b),
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => number(a / b),
        BinaryOp::Rem => number(a % b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    })
}

fn call(func: Function, args: &[Expr], lookup: &dyn Fn(&str) -> Option<Value>) -> Result<Value, EvalError> {
    if func == Function::If {
        if args.len() != 3 {
            return Err(EvalError::Arity("if"));
        }
        return if truthy(&args[0].eval(lookup)?) {
            args[1].eval(lookup)
        } else {
            args[2].eval(lookup)
        };
    }
    let values = args
        .iter()
        .map(|a| a.eval(lookup))
        .collect::<Result<Vec<_>, _>>()?;
    let unary_number = |name: &'static str, f: fn(f64) -> f64| -> Result<Value, EvalError> {
        match values.as_slice() {
            [Value::Null] => Ok(Value::Null),
            [v] => as_number(v)
                .map(|n| number(f(n)))
                .ok_or_else(|| EvalError::TypeMismatch(format!("{} expects a number", name))),
            _ => Err(EvalError::Arity(name)),
        }
    };
    match func {
        Function::Concat => Ok(Value::String(values.iter().map(display).collect())),
        Function::Upper | Function::Lower | Function::Trim => match values.as_slice() {
            [Value::Null] => Ok(Value::Null),
            [v] => {
                let s = display(v);
                Ok(Value::String(match func {
                    Function::Upper => s.to_uppercase(),
                    Function::Lower => s.to_lowercase(),
                    _ => s.trim().to_string(),
                }))
            }
            _ => Err(EvalError::Arity("upper/lower/trim")),
        },
        Function::Len => match values.as_slice() {
            [Value::Null] => Ok(Value::Null),
            [Value::Array(a)] => Ok(number(a.len() as f64)),
            [v] => Ok(number(display(v).chars().count() as f64)),
            _ => Err(EvalError::Arity("len")),
        },
        Function::Round => match values.as_slice() {
            [_] => unary_number("round", f64::round),
            [Value::Null, _] => Ok(Value::Null),
            [v, digits] => {
                let n = as_number(v).ok_or_else(|| EvalError::TypeMismatch("round expects a number".into()))?;
                let d = as_number(digits).unwrap_or(0.0).clamp(0.0, 12.0) as i32;
                let factor = 10f64.powi(d);
                Ok(number((n * factor).round() / factor))
            }
            _ => Err(EvalError::Arity("round")),
        },
        Function::Floor => unary_number("floor", f64::floor),
        Function::Ceil => unary_number("ceil", f64::ceil),
        Function::Abs => unary_number("abs", f64::abs),
        Function::Min | Function::Max => {
            if values.is_empty() {
                return Err(EvalError::Arity("min/max"));
            }
            let mut acc: Option<f64> = None;
            for v in values.iter().filter(|v| !v.is_null()) {
                let n = as_number(v).ok_or_else(|| EvalError::TypeMismatch("min/max expect numbers".into()))?;
                acc = Some(match acc {
                    None => n,
                    Some(a) if func == Function::Min => a.min(n),
                    Some(a) => a.max(n),
                });
            }
            Ok(acc.map(number).unwrap_or(Value::Null))
        }
        Function::Coalesce => Ok(values.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null)),
        Function::If => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(src: &str, record: Value) -> Result<Value, EvalError> {
        let expr = Expr::parse(src).unwrap();
        let lookup = move |name: &str| record.get(name).cloned();
        expr.eval(&lookup)
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval_with("price * qty + 1", json!({"price": 2.5, "qty": 4})).unwrap(), json!(11));
        assert_eq!(eval_with("(1 + 2) * 3", json!({})).unwrap(), json!(9));
        assert_eq!(eval_with("-a + 10 % 4", json!({"a": 1})).unwrap(), json!(1));
    }

    #[test]
    fn string_concat_and_functions() {
        let r = json!({"first": "Ada", "last": "Lovelace"});
        assert_eq!(eval_with("first + ' ' + last", r.clone()).unwrap(), json!("Ada Lovelace"));
        assert_eq!(eval_with("upper(concat(first, '-', last))", r.clone()).unwrap(), json!("ADA-LOVELACE"));
        assert_eq!(eval_with("len(last)", r).unwrap(), json!(8));
    }

    #[test]
    fn braced_references() {
        assert_eq!(eval_with("{{price}} * {qty}", json!({"price": 3, "qty": 2})).unwrap(), json!(6));
    }

    #[test]
    fn conditional_and_logic() {
        let r = json!({"total": 120, "vip": false});
        assert_eq!(eval_with("total > 100 ? 'big' : 'small'", r.clone()).unwrap(), json!("big"));
        assert_eq!(eval_with("if(vip || total >= 120, 0.1, 0)", r).unwrap(), json!(0.1));
    }

    #[test]
    fn nulls_propagate_and_coalesce() {
        let r = json!({"discount": null, "price": 10});
        assert_eq!(eval_with("price - discount", r.clone()).unwrap(), Value::Null);
        assert_eq!(eval_with("price - coalesce(discount, 0)", r).unwrap(), json!(10));
    }

    #[test]
    fn runtime_faults_are_errors() {
        assert_eq!(eval_with("a / b", json!({"a": 1, "b": 0})), Err(EvalError::DivisionByZero));
        assert!(matches!(eval_with("missing + 1", json!({})), Err(EvalError::UnknownField(_))));
        assert!(matches!(eval_with("a * 2", json!({"a": "x"})), Err(EvalError::TypeMismatch(_))));
    }

    #[test]
    fn rounding() {
        assert_eq!(eval_with("round(a, 2)", json!({"a": 3.14159})).unwrap(), json!(3.14));
        assert_eq!(eval_with("round(a)", json!({"a": 2.5})).unwrap(), json!(3));
    }

    #[test]
    fn parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("a +").is_err());
        assert!(Expr::parse("nosuch(a)").is_err());
        assert!(Expr::parse("(a").is_err());
        assert!(Expr::parse("a b").is_err());
    }

    #[test]
    fn lists_referenced_fields() {
        let e = Expr::parse("price * qty + price").unwrap();
        assert_eq!(e.referenced_fields(), vec!["price".to_string(), "qty".to_string()]);
    }
}
