//! Safe arithmetic formula evaluation for calculation actions.
//!
//! The evaluator replaces the host-language `eval` the source system relied
//! on with a restricted pipeline: placeholder substitution, a deny-list
//! sanitizer, a tokenizer, shunting-yard infix-to-postfix conversion, and a
//! postfix stack machine. Division and modulo by zero degrade to `0.0` with
//! a warning rather than failing the enclosing action.

mod units;

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use shared_types::BuildingObject;
use tracing::warn;

use crate::error::FormulaError;

/// Substrings that are never allowed in a formula, regardless of context.
const DENY_TOKENS: &[&str] = &["eval(", "exec(", "import ", "__", "open(", "file("];

/// Characters permitted in a formula after placeholder substitution.
fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c.is_whitespace()
        || matches!(
            c,
            '+' | '-' | '*' | '/' | '^' | '%' | '(' | ')' | '.' | ',' | '_'
                | '{' | '}' | '[' | ']' | '<' | '>' | '=' | '!' | '&' | '|'
        )
}

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.]*)\}").expect("placeholder regex");
    static ref CONVERT_RE: Regex = Regex::new(
        r"^convert\((.+),\s*([A-Za-z0-9]+)\s*,\s*([A-Za-z0-9]+)\s*\)$"
    )
    .expect("convert regex");
}

/// Variables and model data available to one formula evaluation.
///
/// Aggregate placeholders (`{area}`, `{count}`, ...) and prior calculation
/// results are plain named variables; `{objects.<type>.<property>}` sums are
/// computed on demand from the full model object list.
#[derive(Default)]
pub struct FormulaContext<'a> {
    variables: HashMap<String, f64>,
    model_objects: &'a [BuildingObject],
}

impl<'a> FormulaContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model_objects: &'a [BuildingObject]) -> Self {
        Self {
            variables: HashMap::new(),
            model_objects,
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: f64) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<f64> {
        self.variables.get(name).copied()
    }

    /// Sum of a numeric property over all model objects of one type.
    fn object_property_sum(&self, object_type: &str, property: &str) -> f64 {
        self.model_objects
            .iter()
            .filter(|o| o.object_type == object_type)
            .filter_map(|o| o.number_property(property))
            .sum()
    }

    /// Replace `{name}` and `{objects.<type>.<property>}` placeholders with
    /// numeric literals. Unknown placeholders degrade to 0.
    fn substitute(&self, expression: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(expression, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                let value = if let Some(rest) = name.strip_prefix("objects.") {
                    match rest.split_once('.') {
                        Some((object_type, property)) => {
                            self.object_property_sum(object_type, property)
                        }
                        None => {
                            warn!(placeholder = name, "malformed objects placeholder");
                            0.0
                        }
                    }
                } else {
                    match self.variables.get(name) {
                        Some(v) => *v,
                        None => {
                            warn!(placeholder = name, "unknown placeholder, using 0");
                            0.0
                        }
                    }
                };
                format!("({})", value)
            })
            .into_owned()
    }
}

/// Evaluate an expression against a context.
///
/// A whole-expression `convert(value, from_unit, to_unit)` form is detected
/// first; the inner value is evaluated normally and the unit factor applied
/// afterwards.
pub fn evaluate(expression: &str, ctx: &FormulaContext<'_>) -> Result<f64, FormulaError> {
    let substituted = ctx.substitute(expression);
    let trimmed = substituted.trim();

    if let Some(caps) = CONVERT_RE.captures(trimmed) {
        let inner = evaluate_sanitized(&caps[1], ctx)?;
        return units::convert(inner, &caps[2], &caps[3]);
    }

    evaluate_sanitized(trimmed, ctx)
}

fn evaluate_sanitized(expression: &str, ctx: &FormulaContext<'_>) -> Result<f64, FormulaError> {
    sanitize(expression)?;
    let tokens = tokenize(expression, ctx)?;
    let postfix = to_postfix(&tokens)?;
    match run_postfix(&postfix) {
        Err(FormulaError::DivisionByZero) => {
            warn!(formula = expression, "division by zero, degrading to 0");
            Ok(0.0)
        }
        other => other,
    }
}

/// Reject deny-listed substrings, disallowed characters, and unbalanced
/// parentheses before any parsing happens.
fn sanitize(expression: &str) -> Result<(), FormulaError> {
    let lower = expression.to_lowercase();
    for token in DENY_TOKENS {
        if lower.contains(token) {
            return Err(FormulaError::UnsafeToken((*token).trim().to_string()));
        }
    }

    if let Some(c) = expression.chars().find(|c| !is_allowed_char(*c)) {
        return Err(FormulaError::InvalidChar(c));
    }

    let mut depth: i64 = 0;
    for c in expression.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(FormulaError::UnbalancedParens);
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(FormulaError::UnbalancedParens);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Func(&'static str),
    Op(char),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Arity {
    Unary,
    Variadic,
}

const FUNCTIONS: &[(&str, Arity)] = &[
    ("abs", Arity::Unary),
    ("round", Arity::Unary),
    ("floor", Arity::Unary),
    ("ceil", Arity::Unary),
    ("sqrt", Arity::Unary),
    ("log", Arity::Unary),
    ("log10", Arity::Unary),
    ("sin", Arity::Unary),
    ("cos", Arity::Unary),
    ("tan", Arity::Unary),
    ("min", Arity::Variadic),
    ("max", Arity::Variadic),
    ("sum", Arity::Variadic),
    ("avg", Arity::Variadic),
];

fn function_entry(name: &str) -> Option<(&'static str, Arity)> {
    FUNCTIONS.iter().copied().find(|(n, _)| *n == name)
}

/// Tokenize, resolving bare identifiers to context variables. An identifier
/// followed by `(` must name a known function; any other unknown identifier
/// degrades to `0.0` with a warning so one missing property cannot fail a
/// whole calculation action.
fn tokenize(expression: &str, ctx: &FormulaContext<'_>) -> Result<Vec<Tok>, FormulaError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal.parse::<f64>().map_err(|_| FormulaError::Malformed)?;
            tokens.push(Tok::Num(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let mut lookahead = i;
            while lookahead < chars.len() && chars[lookahead].is_whitespace() {
                lookahead += 1;
            }
            let is_call = lookahead < chars.len() && chars[lookahead] == '(';
            if is_call {
                let (name, _) = function_entry(&ident)
                    .ok_or_else(|| FormulaError::UnknownFunction(ident.clone()))?;
                tokens.push(Tok::Func(name));
            } else {
                let value = ctx.variable(&ident).unwrap_or_else(|| {
                    warn!(variable = %ident, "unknown variable, using 0");
                    0.0
                });
                tokens.push(Tok::Num(value));
            }
        } else {
            match c {
                '+' | '-' | '*' | '/' | '%' | '^' => tokens.push(Tok::Op(c)),
                '(' => tokens.push(Tok::LParen),
                ')' => tokens.push(Tok::RParen),
                ',' => tokens.push(Tok::Comma),
                other => return Err(FormulaError::InvalidChar(other)),
            }
            i += 1;
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Pf {
    Num(f64),
    Bin(char),
    Neg,
    Call(&'static str, usize),
}

#[derive(Debug, Clone, PartialEq)]
enum StackOp {
    Bin(char),
    Neg,
    Fun(&'static str),
    Paren,
}

fn precedence(op: &StackOp) -> u8 {
    match op {
        StackOp::Bin('+') | StackOp::Bin('-') => 1,
        StackOp::Bin('*') | StackOp::Bin('/') | StackOp::Bin('%') => 2,
        StackOp::Neg => 3,
        StackOp::Bin('^') => 4,
        _ => 0,
    }
}

fn right_associative(op: &StackOp) -> bool {
    matches!(op, StackOp::Bin('^') | StackOp::Neg)
}

/// Shunting-yard conversion with per-function argument counting.
fn to_postfix(tokens: &[Tok]) -> Result<Vec<Pf>, FormulaError> {
    let mut output = Vec::new();
    let mut ops: Vec<StackOp> = Vec::new();
    let mut arg_counts: Vec<usize> = Vec::new();
    // True when the previous token can terminate an operand, which decides
    // whether +/- are binary or unary.
    let mut prev_operand = false;
    let mut pending_fun = false;

    for tok in tokens {
        match tok {
            Tok::Num(n) => {
                output.push(Pf::Num(*n));
                prev_operand = true;
            }
            Tok::Func(name) => {
                ops.push(StackOp::Fun(*name));
                pending_fun = true;
                prev_operand = false;
                continue;
            }
            Tok::Op(c) => {
                if !prev_operand && (*c == '-' || *c == '+') {
                    if *c == '-' {
                        ops.push(StackOp::Neg);
                    }
                    // Unary plus is a no-op.
                } else if !prev_operand {
                    return Err(FormulaError::Malformed);
                } else {
                    let incoming = StackOp::Bin(*c);
                    while let Some(top) = ops.last() {
                        let should_pop = matches!(top, StackOp::Bin(_) | StackOp::Neg)
                            && (precedence(top) > precedence(&incoming)
                                || (precedence(top) == precedence(&incoming)
                                    && !right_associative(&incoming)));
                        if !should_pop {
                            break;
                        }
                        output.push(pop_op(&mut ops));
                    }
                    ops.push(incoming);
                }
                prev_operand = false;
            }
            Tok::LParen => {
                ops.push(StackOp::Paren);
                if pending_fun {
                    arg_counts.push(1);
                }
                prev_operand = false;
            }
            Tok::Comma => {
                loop {
                    match ops.last() {
                        Some(StackOp::Paren) => break,
                        Some(_) => output.push(pop_op(&mut ops)),
                        None => return Err(FormulaError::Malformed),
                    }
                }
                *arg_counts.last_mut().ok_or(FormulaError::Malformed)? += 1;
                prev_operand = false;
            }
            Tok::RParen => {
                if !prev_operand {
                    return Err(FormulaError::Malformed);
                }
                loop {
                    match ops.pop() {
                        Some(StackOp::Paren) => break,
                        Some(op) => output.push(stack_to_pf(op)?),
                        None => return Err(FormulaError::UnbalancedParens),
                    }
                }
                if let Some(StackOp::Fun(name)) = ops.last().cloned() {
                    ops.pop();
                    let argc = arg_counts.pop().ok_or(FormulaError::Malformed)?;
                    let (_, arity) = function_entry(name).ok_or(FormulaError::Malformed)?;
                    if arity == Arity::Unary && argc != 1 {
                        return Err(FormulaError::BadArity {
                            function: name.to_string(),
                            expected: 1,
                            found: argc,
                        });
                    }
                    output.push(Pf::Call(name, argc));
                }
                prev_operand = true;
            }
        }
        pending_fun = false;
    }

    while let Some(op) = ops.pop() {
        if op == StackOp::Paren {
            return Err(FormulaError::UnbalancedParens);
        }
        output.push(stack_to_pf(op)?);
    }
    Ok(output)
}

fn pop_op(ops: &mut Vec<StackOp>) -> Pf {
    match ops.pop() {
        Some(StackOp::Bin(c)) => Pf::Bin(c),
        Some(StackOp::Neg) => Pf::Neg,
        _ => unreachable!("only operators are popped by precedence"),
    }
}

fn stack_to_pf(op: StackOp) -> Result<Pf, FormulaError> {
    match op {
        StackOp::Bin(c) => Ok(Pf::Bin(c)),
        StackOp::Neg => Ok(Pf::Neg),
        // A function with no argument list, e.g. a dangling `min`.
        StackOp::Fun(_) | StackOp::Paren => Err(FormulaError::Malformed),
    }
}

fn apply_function(name: &str, args: &[f64]) -> f64 {
    match name {
        "abs" => args[0].abs(),
        "round" => args[0].round(),
        "floor" => args[0].floor(),
        "ceil" => args[0].ceil(),
        "sqrt" => args[0].sqrt(),
        "log" => args[0].ln(),
        "log10" => args[0].log10(),
        "sin" => args[0].sin(),
        "cos" => args[0].cos(),
        "tan" => args[0].tan(),
        "min" => args.iter().copied().fold(f64::INFINITY, f64::min),
        "max" => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "sum" => args.iter().sum(),
        "avg" => args.iter().sum::<f64>() / args.len() as f64,
        _ => unreachable!("function names validated during tokenization"),
    }
}

fn run_postfix(postfix: &[Pf]) -> Result<f64, FormulaError> {
    let mut stack: Vec<f64> = Vec::new();

    for item in postfix {
        match item {
            Pf::Num(n) => stack.push(*n),
            Pf::Neg => {
                let x = stack.pop().ok_or(FormulaError::Malformed)?;
                stack.push(-x);
            }
            Pf::Bin(op) => {
                let b = stack.pop().ok_or(FormulaError::Malformed)?;
                let a = stack.pop().ok_or(FormulaError::Malformed)?;
                let value = match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '/' => {
                        if b == 0.0 {
                            return Err(FormulaError::DivisionByZero);
                        }
                        a / b
                    }
                    '%' => {
                        if b == 0.0 {
                            return Err(FormulaError::DivisionByZero);
                        }
                        a % b
                    }
                    '^' => a.powf(b),
                    _ => return Err(FormulaError::Malformed),
                };
                stack.push(value);
            }
            Pf::Call(name, argc) => {
                if stack.len() < *argc {
                    return Err(FormulaError::Malformed);
                }
                let args: Vec<f64> = stack.split_off(stack.len() - argc);
                stack.push(apply_function(name, &args));
            }
        }
    }

    if stack.len() == 1 {
        Ok(stack[0])
    } else {
        Err(FormulaError::Malformed)
    }
}
