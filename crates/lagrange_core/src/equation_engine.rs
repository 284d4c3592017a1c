use crate::error::{ModelError, ModelResult, SimulationError, SimulationResult};
use crate::traits::Scalar;
use std::collections::HashMap;
use std::fmt;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by index) onto the stack.
    /// Indices follow the order the variables were declared in.
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
    /// Pops top value (a), pushes a^n for an integer n.
    PowI(i32),
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Upper bound on the stack depth reached while executing.
    pub fn max_stack_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for op in &self.ops {
            match op {
                OpCode::LoadConst(_) | OpCode::LoadVar(_) | OpCode::LoadParam(_) => depth += 1,
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    depth = depth.saturating_sub(1)
                }
                OpCode::PowI(_) | OpCode::Neg | OpCode::Call(_) => {}
            }
            max_depth = max_depth.max(depth);
        }
        max_depth
    }
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Current state vector (read-only).
/// - `params`: Parameter vector (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the value left on the stack.
pub struct VM;

impl VM {
    /// Executes the bytecode.
    ///
    /// # Type Parameters
    /// * `T`: The scalar type (e.g., `f64` or `Dual`).
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> SimulationResult<T> {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::lift(val)),
                OpCode::LoadVar(idx) => {
                    let value = vars.get(idx).ok_or_else(|| {
                        SimulationError::MalformedBytecode(format!("variable index {idx} out of range"))
                    })?;
                    stack.push(*value);
                }
                OpCode::LoadParam(idx) => {
                    let value = params.get(idx).ok_or_else(|| {
                        SimulationError::MalformedBytecode(format!("parameter index {idx} out of range"))
                    })?;
                    stack.push(*value);
                }
                OpCode::Add => binary(stack, |a, b| a + b)?,
                OpCode::Sub => binary(stack, |a, b| a - b)?,
                OpCode::Mul => binary(stack, |a, b| a * b)?,
                OpCode::Div => binary(stack, |a, b| a / b)?,
                OpCode::Pow => binary(stack, |a, b| a.powf(b))?,
                OpCode::PowI(n) => unary(stack, |a| a.powi(n))?,
                OpCode::Neg => unary(stack, |a| -a)?,
                OpCode::Call(func) => unary(stack, |a| func.apply(a))?,
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(result), true) => Ok(result),
            (None, _) => Err(SimulationError::MalformedBytecode("empty program".into())),
            (Some(_), false) => Err(SimulationError::MalformedBytecode(
                "values left on the stack".into(),
            )),
        }
    }
}

fn pop<T>(stack: &mut Vec<T>) -> SimulationResult<T> {
    stack
        .pop()
        .ok_or_else(|| SimulationError::MalformedBytecode("stack underflow".into()))
}

fn binary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T, T) -> T) -> SimulationResult<()> {
    let b = pop(stack)?;
    let a = pop(stack)?;
    stack.push(f(a, b));
    Ok(())
}

fn unary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T) -> T) -> SimulationResult<()> {
    let a = pop(stack)?;
    stack.push(f(a));
    Ok(())
}

// --- AST ---

/// Elementary functions understood by the parser, the differentiator and the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Self::Sin),
            "cos" => Some(Self::Cos),
            "tan" => Some(Self::Tan),
            "exp" => Some(Self::Exp),
            "ln" | "log" => Some(Self::Ln),
            "sqrt" => Some(Self::Sqrt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Exp => "exp",
            Self::Ln => "ln",
            Self::Sqrt => "sqrt",
        }
    }

    pub fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            Self::Sin => a.sin(),
            Self::Cos => a.cos(),
            Self::Tan => a.tan(),
            Self::Exp => a.exp(),
            Self::Ln => a.ln(),
            Self::Sqrt => a.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
            Self::Pow => '^',
        }
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div => 2,
            Self::Pow => 4,
        }
    }

    pub fn fold(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Pow => a.powf(b),
        }
    }
}

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    pub fn num(value: f64) -> Self {
        Expr::Number(value)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary(Box::new(left), op, Box::new(right))
    }

    pub fn call(func: Function, arg: Expr) -> Self {
        Expr::Call(func, Box::new(arg))
    }

    pub fn pow(self, exponent: Expr) -> Self {
        Expr::binary(self, BinaryOp::Pow, exponent)
    }

    pub fn sin(self) -> Self {
        Expr::call(Function::Sin, self)
    }

    pub fn cos(self) -> Self {
        Expr::call(Function::Cos, self)
    }

    /// Returns the constant value if this node is a literal.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_number() == Some(0.0)
    }

    pub fn is_one(&self) -> bool {
        self.as_number() == Some(1.0)
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        match self {
            Expr::Number(_) | Expr::Variable(_) => 1,
            Expr::Binary(l, _, r) => 1 + l.size() + r.size(),
            Expr::Neg(a) | Expr::Call(_, a) => 1 + a.size(),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary(_, op, _) => op.precedence(),
            Expr::Neg(_) => 3,
            Expr::Number(n) if *n < 0.0 => 3,
            _ => 5,
        }
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(self, BinaryOp::Add, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(self, BinaryOp::Sub, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(self, BinaryOp::Mul, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(self, BinaryOp::Div, rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

// Prints with the minimum parentheses needed for `parse` to read it back.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Neg(a) => {
                if a.precedence() <= 3 {
                    write!(f, "-({a})")
                } else {
                    write!(f, "-{a}")
                }
            }
            Expr::Call(func, a) => write!(f, "{}({a})", func.name()),
            Expr::Binary(l, op, r) => {
                let prec = op.precedence();
                // `^` is right-associative, everything else left-associative.
                let (left_min, right_min) = match op {
                    BinaryOp::Pow => (prec + 1, prec),
                    _ => (prec, prec + 1),
                };
                if l.precedence() < left_min {
                    write!(f, "({l})")?;
                } else {
                    write!(f, "{l}")?;
                }
                write!(f, " {} ", op.symbol())?;
                if r.precedence() < right_min {
                    write!(f, "({r})")
                } else {
                    write!(f, "{r}")
                }
            }
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

    pub fn compile(&self, expr: &Expr) -> ModelResult<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> ModelResult<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else {
                    return Err(ModelError::unknown_symbol(name, "compiled expression"));
                }
            }
            Expr::Binary(left, op, right) => {
                if let (BinaryOp::Pow, Some(n)) = (op, integer_exponent(right)) {
                    self.compile_recursive(left, ops)?;
                    ops.push(OpCode::PowI(n));
                    return Ok(());
                }
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(OpCode::Call(*func));
            }
        }
        Ok(())
    }
}

/// Literal exponents such as `2` compile to `powi`, which keeps dual numbers
/// well-defined for negative bases.
fn integer_exponent(expr: &Expr) -> Option<i32> {
    let n = expr.as_number()?;
    (n.fract() == 0.0 && n.abs() <= i32::MAX as f64).then_some(n as i32)
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> ModelResult<Expr> {
    let fail = |message: String| ModelError::Parse {
        expression: input.to_string(),
        message,
    };
    let tokens = tokenize(input).map_err(fail)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression().map_err(fail)?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(fail(format!("unexpected trailing token {token:?}"))),
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

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if d == 'e' || d == 'E' {
                    // Exponent part: 1e-3, 2.5E+4
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("invalid number literal \"{num_str}\""))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(format!("unexpected character '{other}'")),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_term()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    // Unary minus binds weaker than `^`: -x^2 == -(x^2).
    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            // Right-associative: a^b^c == a^(b^c).
            let exponent = self.parse_unary()?;
            return Ok(Expr::binary(base, BinaryOp::Pow, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let func = Function::from_name(&name)
                        .ok_or_else(|| format!("unknown function \"{name}\""))?;
                    let arg = self.parse_expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::call(func, arg)),
                        _ => Err("expected ')'".to_string()),
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of input".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn eval(source: &str, vars: &[(&str, f64)], params: &[(&str, f64)]) -> f64 {
        let var_names: Vec<String> = vars.iter().map(|(n, _)| n.to_string()).collect();
        let param_names: Vec<String> = params.iter().map(|(n, _)| n.to_string()).collect();
        let var_values: Vec<f64> = vars.iter().map(|(_, v)| *v).collect();
        let param_values: Vec<f64> = params.iter().map(|(_, v)| *v).collect();
        let compiler = Compiler::new(&var_names, &param_names);
        let code = compiler.compile(&parse(source).unwrap()).unwrap();
        VM::execute(&code, &var_values, &param_values, &mut Vec::new()).unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[], &[]), 7.0);
        assert_eq!(eval("2 ^ 3 ^ 2", &[], &[]), 512.0);
        assert_eq!(eval("-x^2", &[("x", 3.0)], &[]), -9.0);
        assert_eq!(eval("8 / 2 / 2", &[], &[]), 2.0);
        assert_eq!(eval("2 * -x", &[("x", 1.5)], &[]), -3.0);
        assert_eq!(eval("10 - 4 - 3", &[], &[]), 3.0);
    }

    #[test]
    fn scientific_literals_and_functions() {
        assert_eq!(eval("1e-3 * 2E+3", &[], &[]), 2.0);
        let value = eval("sin(theta)^2 + cos(theta)^2", &[("theta", 0.7)], &[]);
        assert!((value - 1.0).abs() < 1e-15);
        assert!((eval("ln(exp(g))", &[], &[("g", 9.82)]) - 9.82).abs() < 1e-12);
        assert_eq!(eval("sqrt(16)", &[], &[]), 4.0);
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(parse("x + "), Err(ModelError::Parse { .. })));
        assert!(matches!(parse("(x + 1"), Err(ModelError::Parse { .. })));
        assert!(matches!(parse("x $ y"), Err(ModelError::Parse { .. })));
        assert!(matches!(parse("x y"), Err(ModelError::Parse { .. })));
        assert!(matches!(parse("foo(x)"), Err(ModelError::Parse { .. })));
    }

    #[test]
    fn compiler_rejects_unknown_symbols() {
        let compiler = Compiler::new(&names(&["x"]), &names(&["k"]));
        let err = compiler.compile(&parse("k * y").unwrap()).unwrap_err();
        assert_eq!(err, ModelError::unknown_symbol("y", "compiled expression"));
    }

    #[test]
    fn integer_exponents_compile_to_powi() {
        let compiler = Compiler::new(&names(&["v"]), &[]);
        let code = compiler.compile(&parse("v^2").unwrap()).unwrap();
        assert_eq!(code.ops, vec![OpCode::LoadVar(0), OpCode::PowI(2)]);

        // Negative bases stay differentiable.
        let x = [Dual::new(-3.0, 1.0)];
        let out = VM::execute(&code, &x, &[], &mut Vec::new()).unwrap();
        assert_eq!(out.val, 9.0);
        assert_eq!(out.eps, -6.0);
    }

    #[test]
    fn vm_reports_malformed_bytecode() {
        let code = Bytecode {
            ops: vec![OpCode::LoadConst(1.0), OpCode::Add],
        };
        let err = VM::execute::<f64>(&code, &[], &[], &mut Vec::new()).unwrap_err();
        assert!(matches!(err, SimulationError::MalformedBytecode(_)));

        let code = Bytecode {
            ops: vec![OpCode::LoadVar(3)],
        };
        assert!(VM::execute::<f64>(&code, &[1.0], &[], &mut Vec::new()).is_err());
        assert!(VM::execute::<f64>(&Bytecode::new(), &[], &[], &mut Vec::new()).is_err());
    }

    #[test]
    fn stack_depth_of_nested_program() {
        let compiler = Compiler::new(&names(&["a", "b", "c"]), &[]);
        let code = compiler.compile(&parse("a * (b + c)").unwrap()).unwrap();
        assert_eq!(code.max_stack_depth(), 3);
    }

    #[test]
    fn display_round_trips_through_parser() {
        for source in [
            "-(a + b) * c",
            "a - (b - c)",
            "a / (b * c)",
            "(a ^ b) ^ c",
            "a ^ -b",
            "-a ^ 2",
            "sin(x) * -2",
        ] {
            let expr = parse(source).unwrap();
            let printed = expr.to_string();
            assert_eq!(parse(&printed).unwrap(), expr, "{source} printed as {printed}");
        }
    }
}
