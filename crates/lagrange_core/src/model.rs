//! Declarative description of a mechanical system in terms of energies.
//!
//! A [`ModelDefinition`] is a plain value: coordinates, parameters, one external
//! input, kinetic and potential energy, and one generalized force per coordinate.
//! It carries no numeric values; parameters are bound when a simulation starts.

use crate::equation_engine::{parse, Expr};
use crate::error::{ModelError, ModelResult};
use crate::symbolic;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A generalized coordinate and the name of its time derivative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralizedCoordinate {
    pub name: String,
    pub velocity: String,
}

impl GeneralizedCoordinate {
    pub fn new(name: impl Into<String>, velocity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            velocity: velocity.into(),
        }
    }
}

/// A validated model, ready for derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefinition {
    coordinates: Vec<GeneralizedCoordinate>,
    parameters: Vec<String>,
    input: String,
    kinetic_energy: Expr,
    potential_energy: Expr,
    forces: Vec<Expr>,
}

impl ModelDefinition {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn coordinates(&self) -> &[GeneralizedCoordinate] {
        &self.coordinates
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn kinetic_energy(&self) -> &Expr {
        &self.kinetic_energy
    }

    pub fn potential_energy(&self) -> &Expr {
        &self.potential_energy
    }

    pub fn forces(&self) -> &[Expr] {
        &self.forces
    }

    /// Number of generalized coordinates.
    pub fn degrees_of_freedom(&self) -> usize {
        self.coordinates.len()
    }

    /// State variable names in state-vector order: positions, then velocities.
    pub fn state_names(&self) -> Vec<String> {
        self.coordinates
            .iter()
            .map(|c| c.name.clone())
            .chain(self.coordinates.iter().map(|c| c.velocity.clone()))
            .collect()
    }

    /// Parameter names followed by the input name, the order evaluators expect
    /// their constant slots in.
    pub fn constant_names(&self) -> Vec<String> {
        let mut names = self.parameters.clone();
        names.push(self.input.clone());
        names
    }

    /// The Lagrangian `T - V`.
    pub fn lagrangian(&self) -> Expr {
        self.kinetic_energy.clone() - self.potential_energy.clone()
    }
}

/// Builder for [`ModelDefinition`]. Expressions may be given as text or as
/// [`Expr`] values; text is parsed when added and parse failures surface from
/// [`ModelBuilder::build`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    coordinates: Vec<GeneralizedCoordinate>,
    parameters: Vec<String>,
    input: Option<String>,
    kinetic_energy: Option<Expr>,
    potential_energy: Option<Expr>,
    forces: Vec<Expr>,
    errors: Vec<ModelError>,
}

impl ModelBuilder {
    pub fn coordinate(mut self, name: impl Into<String>, velocity: impl Into<String>) -> Self {
        self.coordinates
            .push(GeneralizedCoordinate::new(name, velocity));
        self
    }

    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    pub fn parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters.extend(names.into_iter().map(Into::into));
        self
    }

    /// Name of the external input symbol. Defaults to `u`.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.input = Some(name.into());
        self
    }

    pub fn kinetic_energy(mut self, expr: impl IntoExpr) -> Self {
        self.kinetic_energy = self.absorb(expr);
        self
    }

    pub fn potential_energy(mut self, expr: impl IntoExpr) -> Self {
        self.potential_energy = self.absorb(expr);
        self
    }

    pub fn force(mut self, expr: impl IntoExpr) -> Self {
        if let Some(expr) = self.absorb(expr) {
            self.forces.push(expr);
        }
        self
    }

    pub fn forces<I, E>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: IntoExpr,
    {
        for expr in exprs {
            self = self.force(expr);
        }
        self
    }

    /// Coordinates declared so far, for building velocity expressions with
    /// [`symbolic::time_derivative`] before the energies are set.
    pub fn declared_coordinates(&self) -> &[GeneralizedCoordinate] {
        &self.coordinates
    }

    fn absorb(&mut self, expr: impl IntoExpr) -> Option<Expr> {
        match expr.into_expr() {
            Ok(expr) => Some(expr),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    pub fn build(self) -> ModelResult<ModelDefinition> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        if self.coordinates.is_empty() {
            return Err(ModelError::EmptyModel);
        }

        let input = self.input.unwrap_or_else(|| "u".to_string());
        let mut seen = HashSet::new();
        let declared = self
            .coordinates
            .iter()
            .flat_map(|c| [&c.name, &c.velocity])
            .chain(self.parameters.iter())
            .chain(std::iter::once(&input));
        for name in declared {
            if !seen.insert(name.as_str()) {
                return Err(ModelError::DuplicateSymbol(name.clone()));
            }
        }

        if self.forces.len() != self.coordinates.len() {
            return Err(ModelError::dimension_mismatch(
                "generalized forces",
                self.coordinates.len(),
                self.forces.len(),
            ));
        }

        let kinetic_energy = self.kinetic_energy.unwrap_or_else(|| Expr::num(0.0));
        let potential_energy = self.potential_energy.unwrap_or_else(|| Expr::num(0.0));

        let mut energy_symbols: HashSet<&str> = self
            .coordinates
            .iter()
            .flat_map(|c| [c.name.as_str(), c.velocity.as_str()])
            .collect();
        energy_symbols.extend(self.parameters.iter().map(String::as_str));

        for (expr, context) in [
            (&kinetic_energy, "kinetic energy"),
            (&potential_energy, "potential energy"),
        ] {
            for symbol in symbolic::symbols(expr) {
                if symbol == input {
                    return Err(ModelError::InputInEnergy(symbol));
                }
                if !energy_symbols.contains(symbol.as_str()) {
                    return Err(ModelError::unknown_symbol(symbol, context));
                }
            }
        }

        for (i, force) in self.forces.iter().enumerate() {
            for symbol in symbolic::symbols(force) {
                if symbol != input && !energy_symbols.contains(symbol.as_str()) {
                    return Err(ModelError::unknown_symbol(
                        symbol,
                        format!("generalized force {i}"),
                    ));
                }
            }
        }

        Ok(ModelDefinition {
            coordinates: self.coordinates,
            parameters: self.parameters,
            input,
            kinetic_energy,
            potential_energy,
            forces: self.forces,
        })
    }
}

/// Anything the builder accepts as an expression.
pub trait IntoExpr {
    fn into_expr(self) -> ModelResult<Expr>;
}

impl IntoExpr for Expr {
    fn into_expr(self) -> ModelResult<Expr> {
        Ok(self)
    }
}

impl IntoExpr for &Expr {
    fn into_expr(self) -> ModelResult<Expr> {
        Ok(self.clone())
    }
}

impl IntoExpr for &str {
    fn into_expr(self) -> ModelResult<Expr> {
        parse(self)
    }
}

impl IntoExpr for String {
    fn into_expr(self) -> ModelResult<Expr> {
        parse(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oscillator() -> ModelBuilder {
        ModelDefinition::builder()
            .coordinate("x", "xdot")
            .parameters(["m", "k"])
            .input("F")
            .kinetic_energy("0.5 * m * xdot^2")
            .potential_energy("0.5 * k * x^2")
    }

    #[test]
    fn builds_valid_model() {
        let model = oscillator().force("F").build().unwrap();
        assert_eq!(model.degrees_of_freedom(), 1);
        assert_eq!(model.state_names(), vec!["x", "xdot"]);
        assert_eq!(model.constant_names(), vec!["m", "k", "F"]);
        assert_eq!(model.input(), "F");
    }

    #[test]
    fn force_count_must_match_coordinates() {
        let err = oscillator().build().unwrap_err();
        assert_eq!(err, ModelError::dimension_mismatch("generalized forces", 1, 0));

        let err = oscillator().forces(["F", "0"]).build().unwrap_err();
        assert_eq!(err, ModelError::dimension_mismatch("generalized forces", 1, 2));
    }

    #[test]
    fn rejects_duplicates_and_unknown_symbols() {
        let err = oscillator().parameter("x").force("F").build().unwrap_err();
        assert_eq!(err, ModelError::DuplicateSymbol("x".into()));

        let err = oscillator()
            .potential_energy("0.5 * k * y^2")
            .force("F")
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::unknown_symbol("y", "potential energy"));

        let err = oscillator().force("F * c").build().unwrap_err();
        assert_eq!(err, ModelError::unknown_symbol("c", "generalized force 0"));
    }

    #[test]
    fn input_is_confined_to_forces() {
        let err = oscillator()
            .kinetic_energy("0.5 * m * xdot^2 + F")
            .force("F")
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::InputInEnergy("F".into()));
    }

    #[test]
    fn parse_errors_surface_from_build() {
        let err = oscillator().force("F +").build().unwrap_err();
        assert!(matches!(err, ModelError::Parse { .. }));
    }

    #[test]
    fn empty_model_is_rejected() {
        assert_eq!(
            ModelDefinition::builder().build().unwrap_err(),
            ModelError::EmptyModel
        );
    }
}
