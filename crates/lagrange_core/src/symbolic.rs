//! Symbolic calculus on [`Expr`] trees.
//!
//! Differentiation goes through the same smart constructors as [`simplify`], so
//! trivial terms (`0 * u`, `u * 1`, `u + 0`) never enter the result. Simplification
//! is best-effort: it folds constants and removes identities, nothing more.

use crate::equation_engine::{BinaryOp, Expr, Function};
use crate::model::GeneralizedCoordinate;
use std::collections::BTreeSet;

/// Returns `true` if `expr` references `symbol`.
pub fn contains(expr: &Expr, symbol: &str) -> bool {
    match expr {
        Expr::Number(_) => false,
        Expr::Variable(name) => name == symbol,
        Expr::Binary(l, _, r) => contains(l, symbol) || contains(r, symbol),
        Expr::Neg(a) | Expr::Call(_, a) => contains(a, symbol),
    }
}

/// Set of all symbol names referenced by `expr`.
pub fn symbols(expr: &Expr) -> BTreeSet<String> {
    fn collect(expr: &Expr, out: &mut BTreeSet<String>) {
        match expr {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                out.insert(name.clone());
            }
            Expr::Binary(l, _, r) => {
                collect(l, out);
                collect(r, out);
            }
            Expr::Neg(a) | Expr::Call(_, a) => collect(a, out),
        }
    }
    let mut out = BTreeSet::new();
    collect(expr, &mut out);
    out
}

/// Replaces every occurrence of `symbol` with `replacement`.
pub fn substitute(expr: &Expr, symbol: &str, replacement: &Expr) -> Expr {
    match expr {
        Expr::Variable(name) if name == symbol => replacement.clone(),
        Expr::Number(_) | Expr::Variable(_) => expr.clone(),
        Expr::Binary(l, op, r) => Expr::binary(
            substitute(l, symbol, replacement),
            *op,
            substitute(r, symbol, replacement),
        ),
        Expr::Neg(a) => -substitute(a, symbol, replacement),
        Expr::Call(func, a) => Expr::call(*func, substitute(a, symbol, replacement)),
    }
}

/// Partial derivative of `expr` with respect to `symbol`.
pub fn differentiate(expr: &Expr, symbol: &str) -> Expr {
    if !contains(expr, symbol) {
        return Expr::num(0.0);
    }

    match expr {
        Expr::Number(_) => Expr::num(0.0),
        Expr::Variable(_) => Expr::num(1.0),
        Expr::Neg(a) => negate(differentiate(a, symbol)),
        Expr::Binary(a, op, b) => {
            let da = differentiate(a, symbol);
            let db = differentiate(b, symbol);
            let (a, b) = (a.as_ref().clone(), b.as_ref().clone());
            match op {
                BinaryOp::Add => sum(da, db),
                BinaryOp::Sub => difference(da, db),
                BinaryOp::Mul => sum(product(da, b), product(a, db)),
                BinaryOp::Div => {
                    if db.is_zero() {
                        quotient(da, b)
                    } else {
                        // (a' b - a b') / b^2
                        quotient(
                            difference(product(da, b.clone()), product(a, db)),
                            power(b, Expr::num(2.0)),
                        )
                    }
                }
                BinaryOp::Pow => {
                    if db.is_zero() {
                        // d(u^c) = c u^(c-1) u'
                        let reduced = difference(b.clone(), Expr::num(1.0));
                        product(product(b, power(a, reduced)), da)
                    } else {
                        // d(u^v) = u^v (v' ln u + v u' / u)
                        let log_term = product(db, Expr::call(Function::Ln, a.clone()));
                        let base_term = quotient(product(b.clone(), da), a.clone());
                        product(power(a, b), sum(log_term, base_term))
                    }
                }
            }
        }
        Expr::Call(func, a) => {
            let da = differentiate(a, symbol);
            let a = a.as_ref().clone();
            let outer = match func {
                Function::Sin => call(Function::Cos, a),
                Function::Cos => negate(call(Function::Sin, a)),
                Function::Tan => sum(
                    Expr::num(1.0),
                    power(call(Function::Tan, a), Expr::num(2.0)),
                ),
                Function::Exp => call(Function::Exp, a),
                Function::Ln => return quotient(da, a),
                Function::Sqrt => {
                    return quotient(da, product(Expr::num(2.0), call(Function::Sqrt, a)))
                }
            };
            product(outer, da)
        }
    }
}

/// Gradient of `expr` with respect to each of `wrt`, in order.
pub fn gradient<S: AsRef<str>>(expr: &Expr, wrt: &[S]) -> Vec<Expr> {
    wrt.iter()
        .map(|symbol| differentiate(expr, symbol.as_ref()))
        .collect()
}

/// Total time derivative of an expression in the coordinates:
/// `d/dt e(q) = sum_i de/dq_i * qdot_i`.
///
/// Velocities appearing in `expr` are treated as constants, so this is only the
/// chain rule through the positions (Jacobian times velocity).
pub fn time_derivative(expr: &Expr, coordinates: &[GeneralizedCoordinate]) -> Expr {
    coordinates.iter().fold(Expr::num(0.0), |acc, coord| {
        let partial = differentiate(expr, &coord.name);
        sum(acc, product(partial, Expr::var(coord.velocity.clone())))
    })
}

/// Best-effort algebraic simplification.
pub fn simplify(expr: &Expr) -> Expr {
    match expr {
        Expr::Number(_) | Expr::Variable(_) => expr.clone(),
        Expr::Neg(a) => negate(simplify(a)),
        Expr::Call(func, a) => call(*func, simplify(a)),
        Expr::Binary(l, op, r) => {
            let (l, r) = (simplify(l), simplify(r));
            match op {
                BinaryOp::Add => sum(l, r),
                BinaryOp::Sub => difference(l, r),
                BinaryOp::Mul => product(l, r),
                BinaryOp::Div => quotient(l, r),
                BinaryOp::Pow => power(l, r),
            }
        }
    }
}

fn fold(op: BinaryOp, a: &Expr, b: &Expr) -> Option<Expr> {
    let value = op.fold(a.as_number()?, b.as_number()?);
    value.is_finite().then(|| Expr::num(value))
}

fn sum(a: Expr, b: Expr) -> Expr {
    if let Some(folded) = fold(BinaryOp::Add, &a, &b) {
        return folded;
    }
    if a.is_zero() {
        return b;
    }
    if b.is_zero() {
        return a;
    }
    match b {
        Expr::Neg(inner) => difference(a, *inner),
        Expr::Number(n) if n < 0.0 => difference(a, Expr::num(-n)),
        b => a + b,
    }
}

fn difference(a: Expr, b: Expr) -> Expr {
    if let Some(folded) = fold(BinaryOp::Sub, &a, &b) {
        return folded;
    }
    if b.is_zero() {
        return a;
    }
    if a.is_zero() {
        return negate(b);
    }
    if a == b {
        return Expr::num(0.0);
    }
    match b {
        Expr::Neg(inner) => sum(a, *inner),
        b => a - b,
    }
}

fn product(a: Expr, b: Expr) -> Expr {
    if let Some(folded) = fold(BinaryOp::Mul, &a, &b) {
        return folded;
    }
    if a.is_zero() || b.is_zero() {
        return Expr::num(0.0);
    }
    if a.is_one() {
        return b;
    }
    if b.is_one() {
        return a;
    }
    if a.as_number() == Some(-1.0) {
        return negate(b);
    }
    if b.as_number() == Some(-1.0) {
        return negate(a);
    }
    // Two constants that did not fold overflow; keep the product as written.
    if a.as_number().is_some() && b.as_number().is_some() {
        return Expr::binary(a, BinaryOp::Mul, b);
    }
    match (a, b) {
        (Expr::Neg(x), y) => negate(product(*x, y)),
        (x, Expr::Neg(y)) => negate(product(x, *y)),
        // Constants lead: (x * 2) -> (2 * x).
        (x, Expr::Number(n)) => product(Expr::Number(n), x),
        // 2 * (3 * x) -> 6 * x
        (Expr::Number(n), Expr::Binary(l, BinaryOp::Mul, r)) if l.as_number().is_some() => {
            product(product(Expr::Number(n), *l), *r)
        }
        (x, y) => x * y,
    }
}

fn quotient(a: Expr, b: Expr) -> Expr {
    if let Some(folded) = fold(BinaryOp::Div, &a, &b) {
        return folded;
    }
    if b.is_one() {
        return a;
    }
    if a.is_zero() && !b.is_zero() {
        return Expr::num(0.0);
    }
    match (a, b) {
        (Expr::Neg(x), y) => negate(quotient(*x, y)),
        (x, Expr::Neg(y)) => negate(quotient(x, *y)),
        (x, y) => x / y,
    }
}

fn power(a: Expr, b: Expr) -> Expr {
    if let Some(folded) = fold(BinaryOp::Pow, &a, &b) {
        return folded;
    }
    if b.is_zero() || a.is_one() {
        return Expr::num(1.0);
    }
    if b.is_one() {
        return a;
    }
    a.pow(b)
}

fn negate(a: Expr) -> Expr {
    match a {
        Expr::Number(n) => Expr::num(-n),
        Expr::Neg(inner) => *inner,
        a => -a,
    }
}

fn call(func: Function, a: Expr) -> Expr {
    if let Some(n) = a.as_number() {
        let value = func.apply(n);
        if value.is_finite() {
            return Expr::num(value);
        }
    }
    Expr::call(func, a)
}
