//! Search space definitions.

use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, OptimizerResult};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name as suggested by the objective (e.g. "alpha").
    pub name: String,
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
}

impl ParameterKind {
    /// Bounds of the space samplers work in (log-space for log-uniform).
    pub fn internal_bounds(&self) -> (f64, f64) {
        match *self {
            ParameterKind::FloatRange { low, high } => (low, high),
            ParameterKind::LogUniform { low, high } => (low.ln(), high.ln()),
        }
    }

    pub fn to_internal(&self, value: f64) -> f64 {
        match self {
            ParameterKind::FloatRange { .. } => value,
            ParameterKind::LogUniform { .. } => value.ln(),
        }
    }

    /// Map back from sampler space, clamped to the declared range.
    pub fn from_internal(&self, internal: f64) -> f64 {
        match *self {
            ParameterKind::FloatRange { low, high } => internal.clamp(low, high),
            ParameterKind::LogUniform { low, high } => internal.exp().clamp(low, high),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        match *self {
            ParameterKind::FloatRange { low, high } | ParameterKind::LogUniform { low, high } => {
                value >= low && value <= high
            }
        }
    }

    fn validate(&self, name: &str) -> OptimizerResult<()> {
        let (low, high) = match *self {
            ParameterKind::FloatRange { low, high } | ParameterKind::LogUniform { low, high } => (low, high),
        };
        let ok = low.is_finite() && high.is_finite() && low <= high;
        let positive = !matches!(self, ParameterKind::LogUniform { .. }) || low > 0.0;
        if !(ok && positive) {
            return Err(OptimizerError::InvalidSearchSpace {
                message: format!("parameter '{name}' has invalid range {self:?}"),
            });
        }
        Ok(())
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn get(&self, name: &str) -> OptimizerResult<&ParameterDef> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| OptimizerError::UnknownParameter {
                name: name.to_string(),
            })
    }

    pub fn validate(&self) -> OptimizerResult<()> {
        for (i, param) in self.parameters.iter().enumerate() {
            param.kind.validate(&param.name)?;
            if self.parameters[..i].iter().any(|p| p.name == param.name) {
                return Err(OptimizerError::InvalidSearchSpace {
                    message: format!("parameter '{}' is declared twice", param.name),
                });
            }
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_uniform_maps_through_log_space() {
        let kind = ParameterKind::LogUniform { low: 1e-12, high: 1e12 };
        let (lo, hi) = kind.internal_bounds();
        assert!((lo + hi).abs() < 1e-9);
        assert!((kind.from_internal(kind.to_internal(3.5)) - 3.5).abs() < 1e-12);
        assert_eq!(kind.from_internal(100.0), 1e12);
        assert!(kind.contains(1.0));
        assert!(!kind.contains(0.0));
    }

    #[test]
    fn lookup_and_validation() {
        let space = SearchSpace::new()
            .add_log_uniform("alpha", 1e-12, 1e12)
            .add_float("gamma", 0.0, 1.0);
        assert!(space.validate().is_ok());
        assert_eq!(space.get("gamma").unwrap().kind, ParameterKind::FloatRange { low: 0.0, high: 1.0 });
        assert!(matches!(space.get("beta"), Err(OptimizerError::UnknownParameter { .. })));

        assert!(SearchSpace::new().add_log_uniform("a", 0.0, 1.0).validate().is_err());
        assert!(SearchSpace::new().add_float("a", 2.0, 1.0).validate().is_err());
        assert!(SearchSpace::new().add_float("a", 0.0, 1.0).add_float("a", 0.0, 2.0).validate().is_err());
    }

    #[test]
    fn search_space_round_trips_through_json() {
        let space = SearchSpace::new().add_log_uniform("alpha", 1e-12, 1e12);
        let json = serde_json::to_string(&space).unwrap();
        let back: SearchSpace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, space);
    }
}
