use crate::traits::Scalar;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while turning source text into bytecode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Expression is empty.")]
    Empty,
    #[error("Unexpected character '{0}' at position {1}.")]
    UnexpectedCharacter(char, usize),
    #[error("Invalid number literal '{0}'.")]
    InvalidNumber(String),
    #[error("Expected ')'.")]
    MissingClosingParen,
    #[error("Unexpected token {0}.")]
    UnexpectedToken(String),
    #[error("Unexpected end of expression.")]
    UnexpectedEnd,
    #[error("Unknown variable or parameter: {0}")]
    UnknownSymbol(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
}

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or f32).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a variable (by index) onto the stack.
    /// Indices correspond to the order variables were defined (0=x, 1=y, 2=z).
    LoadVar(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Abs,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    /// Deepest stack the program reaches, known at compile time.
    pub max_depth: usize,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stack-based Virtual Machine for evaluating expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Variable values (read-only).
/// - `params`: Parameter values (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Evaluation never panics: a malformed program yields NaN.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(*val).unwrap_or_else(T::nan));
                }
                OpCode::LoadVar(idx) => {
                    stack.push(vars.get(*idx).copied().unwrap_or_else(T::nan));
                }
                OpCode::LoadParam(idx) => {
                    stack.push(params.get(*idx).copied().unwrap_or_else(T::nan));
                }
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, scalar_pow),
                OpCode::Sin => unary(stack, T::sin),
                OpCode::Cos => unary(stack, T::cos),
                OpCode::Tan => unary(stack, T::tan),
                OpCode::Exp => unary(stack, T::exp),
                OpCode::Ln => unary(stack, T::ln),
                OpCode::Sqrt => unary(stack, T::sqrt),
                OpCode::Abs => unary(stack, T::abs),
                OpCode::Neg => unary(stack, |a: T| -a),
            }
        }

        stack.pop().unwrap_or_else(T::nan)
    }

    /// Convenience wrapper that allocates a right-sized stack per call.
    pub fn evaluate<T: Scalar>(bytecode: &Bytecode, vars: &[T], params: &[T]) -> T {
        let mut stack = Vec::with_capacity(bytecode.max_depth);
        Self::execute(bytecode, vars, params, &mut stack)
    }
}

fn unary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T) -> T) {
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a));
}

fn binary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T, T) -> T) {
    let b = stack.pop().unwrap_or_else(T::nan);
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a, b));
}

// Integer exponents go through powi so negative bases stay real (x^2 with x < 0).
fn scalar_pow<T: Scalar>(a: T, b: T) -> T {
    if b == b.round() && b.abs() <= T::from_f64(64.0).unwrap_or_else(T::nan) {
        if let Some(n) = b.to_i32() {
            return a.powi(n);
        }
    }
    a.powf(b)
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),             // only '-'
    Call(String, Box<Expr>),            // functions like sin(x)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) if *n < 0.0 => write!(f, "(-{})", -n),
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Binary(left, op, right) => write!(f, "({left} {op} {right})"),
            Expr::Unary(op, operand) => write!(f, "({op}{operand})"),
            Expr::Call(func, arg) => write!(f, "{func}({arg})"),
        }
    }
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves variable and parameter names to indices.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let mut var_map = HashMap::new();
        for (i, name) in var_names.iter().enumerate() {
            var_map.insert(name.clone(), i);
        }

        let mut param_map = HashMap::new();
        for (i, name) in param_names.iter().enumerate() {
            param_map.insert(name.clone(), i);
        }

        Self { var_map, param_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, ExpressionError> {
        let mut bytecode = Bytecode::new();
        let mut depth = 0usize;
        self.compile_recursive(expr, &mut bytecode, &mut depth)?;
        Ok(bytecode)
    }

    fn compile_recursive(
        &self,
        expr: &Expr,
        code: &mut Bytecode,
        depth: &mut usize,
    ) -> Result<(), ExpressionError> {
        match expr {
            Expr::Number(n) => push(code, depth, OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    push(code, depth, OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    push(code, depth, OpCode::LoadParam(idx));
                } else {
                    return Err(ExpressionError::UnknownSymbol(name.clone()));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, code, depth)?;
                self.compile_recursive(right, code, depth)?;
                let opcode = match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    other => return Err(ExpressionError::UnexpectedToken(format!("'{other}'"))),
                };
                code.ops.push(opcode);
                *depth -= 1;
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, code, depth)?;
                match op {
                    '-' => code.ops.push(OpCode::Neg),
                    other => return Err(ExpressionError::UnexpectedToken(format!("'{other}'"))),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, code, depth)?;
                let opcode = match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" | "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => return Err(ExpressionError::UnknownFunction(func.clone())),
                };
                code.ops.push(opcode);
            }
        }
        Ok(())
    }
}

fn push(code: &mut Bytecode, depth: &mut usize, op: OpCode) {
    code.ops.push(op);
    *depth += 1;
    code.max_depth = code.max_depth.max(*depth);
}

// --- Parser ---

/// Parses a string expression into an AST.
///
/// Grammar, loosest first: sums, products, unary minus, right-associative
/// powers, primaries. The whole input must be consumed.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_sum()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("'{n}'"),
            Token::Identifier(name) => format!("'{name}'"),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Caret => "'^'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent only when digits follow, so `2e` stays a parse error
            // rather than silently becoming 2.
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        j += 1;
                    }
                    i = j;
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Identifier(chars[start..i].iter().collect()));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => return Err(ExpressionError::UnexpectedCharacter(c, i)),
            };
            tokens.push(token);
            i += 1;
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

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_sum(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_product()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(operand)));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_sum()?;
                    self.expect_closing()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else if name == "pi" {
                    Ok(Expr::Number(std::f64::consts::PI))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_sum()?;
                self.expect_closing()?;
                Ok(expr)
            }
            Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn expect_closing(&mut self) -> Result<(), ExpressionError> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(ExpressionError::MissingClosingParen),
        }
    }
}

// --- Symbolic differentiation ---

/// Returns true if `expr` references the variable `var`.
pub fn depends_on(expr: &Expr, var: &str) -> bool {
    match expr {
        Expr::Number(_) => false,
        Expr::Variable(name) => name == var,
        Expr::Binary(left, _, right) => depends_on(left, var) || depends_on(right, var),
        Expr::Unary(_, operand) | Expr::Call(_, operand) => depends_on(operand, var),
    }
}

/// Symbolic partial derivative of `expr` with respect to `var`.
///
/// Every other identifier is held constant. Trivial terms are folded as the
/// derivative is built, so `d/dx (x^2 + y^2)` comes out as `(2 * x)`.
pub fn differentiate(expr: &Expr, var: &str) -> Result<Expr, ExpressionError> {
    if !depends_on(expr, var) {
        return Ok(Expr::Number(0.0));
    }
    let derivative = match expr {
        Expr::Number(_) => Expr::Number(0.0),
        Expr::Variable(name) => Expr::Number(if name == var { 1.0 } else { 0.0 }),
        Expr::Binary(a, op, b) => {
            let da = differentiate(a, var)?;
            let db = differentiate(b, var)?;
            let (a, b) = (a.as_ref().clone(), b.as_ref().clone());
            match op {
                '+' => add(da, db),
                '-' => sub(da, db),
                '*' => add(mul(da, b.clone()), mul(a, db)),
                '/' => div(
                    sub(mul(da, b.clone()), mul(a, db)),
                    pow(b, Expr::Number(2.0)),
                ),
                '^' if !depends_on(&b, var) => mul(
                    mul(b.clone(), pow(a, sub(b, Expr::Number(1.0)))),
                    da,
                ),
                '^' => mul(
                    pow(a.clone(), b.clone()),
                    add(mul(db, call("ln", a.clone())), div(mul(b, da), a)),
                ),
                other => return Err(ExpressionError::UnexpectedToken(format!("'{other}'"))),
            }
        }
        Expr::Unary(_, operand) => neg(differentiate(operand, var)?),
        Expr::Call(func, arg) => {
            let du = differentiate(arg, var)?;
            let u = arg.as_ref().clone();
            match func.as_str() {
                "sin" => mul(call("cos", u), du),
                "cos" => neg(mul(call("sin", u), du)),
                "tan" => div(du, pow(call("cos", u), Expr::Number(2.0))),
                "exp" => mul(call("exp", u), du),
                "ln" | "log" => div(du, u),
                "sqrt" => div(du, mul(Expr::Number(2.0), call("sqrt", u))),
                "abs" => mul(div(u.clone(), call("abs", u)), du),
                _ => return Err(ExpressionError::UnknownFunction(func.clone())),
            }
        }
    };
    Ok(derivative)
}

fn number(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(n) => Some(*n),
        _ => None,
    }
}

fn folded(value: f64, fallback: Expr) -> Expr {
    if value.is_finite() {
        Expr::Number(value)
    } else {
        fallback
    }
}

fn binary_expr(a: Expr, op: char, b: Expr) -> Expr {
    Expr::Binary(Box::new(a), op, Box::new(b))
}

fn call(func: &str, arg: Expr) -> Expr {
    Expr::Call(func.to_string(), Box::new(arg))
}

fn add(a: Expr, b: Expr) -> Expr {
    match (number(&a), number(&b)) {
        (Some(x), Some(y)) => Expr::Number(x + y),
        (Some(x), _) if x == 0.0 => b,
        (_, Some(y)) if y == 0.0 => a,
        _ => binary_expr(a, '+', b),
    }
}

fn sub(a: Expr, b: Expr) -> Expr {
    match (number(&a), number(&b)) {
        (Some(x), Some(y)) => Expr::Number(x - y),
        (_, Some(y)) if y == 0.0 => a,
        (Some(x), _) if x == 0.0 => neg(b),
        _ => binary_expr(a, '-', b),
    }
}

fn mul(a: Expr, b: Expr) -> Expr {
    match (number(&a), number(&b)) {
        (Some(x), Some(y)) => Expr::Number(x * y),
        (Some(x), _) | (_, Some(x)) if x == 0.0 => Expr::Number(0.0),
        (Some(x), _) if x == 1.0 => b,
        (_, Some(y)) if y == 1.0 => a,
        _ => binary_expr(a, '*', b),
    }
}

fn div(a: Expr, b: Expr) -> Expr {
    match (number(&a), number(&b)) {
        (Some(x), _) if x == 0.0 => Expr::Number(0.0),
        (_, Some(y)) if y == 1.0 => a,
        (Some(x), Some(y)) => folded(x / y, binary_expr(a, '/', b)),
        _ => binary_expr(a, '/', b),
    }
}

fn pow(a: Expr, b: Expr) -> Expr {
    match (number(&a), number(&b)) {
        (_, Some(y)) if y == 0.0 => Expr::Number(1.0),
        (_, Some(y)) if y == 1.0 => a,
        (Some(x), Some(y)) => folded(x.powf(y), binary_expr(a, '^', b)),
        _ => binary_expr(a, '^', b),
    }
}

fn neg(a: Expr) -> Expr {
    match a {
        Expr::Number(x) => Expr::Number(-x),
        Expr::Unary('-', inner) => *inner,
        other => Expr::Unary('-', Box::new(other)),
    }
}
