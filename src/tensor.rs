//! Named, shaped tensor descriptors.
//!
//! A [`Variable`] is exclusively owned by the single layer that declares
//! it; other layers reference it by name only, so renaming an output is
//! visible to every consumer by construction.

use serde::{Deserialize, Serialize};

use crate::{
    error::{CompileError, Result},
    precision::Precision,
};

pub type Shape = Vec<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    Input,
    Output,
    Weight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub shape: Shape,
    pub kind: VariableKind,
    pub precision: Precision,
    /// Concrete numeric data, present for weights only.
    data: Option<Vec<f64>>,
}

impl Variable {
    pub fn input(name: impl Into<String>, shape: Shape, precision: Precision) -> Self {
        Self {
            name: name.into(),
            shape,
            kind: VariableKind::Input,
            precision,
            data: None,
        }
    }

    pub fn output(name: impl Into<String>, shape: Shape, precision: Precision) -> Self {
        Self {
            name: name.into(),
            shape,
            kind: VariableKind::Output,
            precision,
            data: None,
        }
    }

    pub fn weight(
        name: impl Into<String>,
        shape: Shape,
        precision: Precision,
        data: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            shape,
            kind: VariableKind::Weight,
            precision,
            data: Some(data),
        }
    }

    /// A weight of the same name/shape/precision with all-zero data, used
    /// when a pass folds a bias away.
    pub fn zeros_like(other: &Self) -> Self {
        Self {
            name: other.name.clone(),
            shape: other.shape.clone(),
            kind: VariableKind::Weight,
            precision: other.precision,
            data: Some(vec![0.0; other.size()]),
        }
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> Result<&[f64]> {
        self.data.as_deref().ok_or_else(|| {
            CompileError::structural(&self.name, "variable carries no weight data")
        })
    }

    pub fn set_data(&mut self, data: Vec<f64>) {
        self.data = Some(data);
    }

    /// Map the weight data in place, leaving shape and precision alone.
    pub fn map_data(&mut self, f: impl Fn(f64) -> f64) {
        if let Some(data) = self.data.as_mut() {
            for v in data.iter_mut() {
                *v = f(*v);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_size_and_data() {
        let w = Variable::weight(
            "w0",
            vec![2, 3],
            Precision::fixed(16, 6).unwrap(),
            vec![1.0; 6],
        );
        assert_eq!(w.size(), 6);
        assert_eq!(w.data().unwrap().len(), 6);

        let out = Variable::output("a_out", vec![4], Precision::Xnor);
        assert!(out.data().is_err());
    }

    #[test]
    fn test_zeros_like() {
        let w = Variable::weight(
            "bias",
            vec![4],
            Precision::Ternary,
            vec![0.5, -0.5, 1.0, 0.0],
        );
        let z = Variable::zeros_like(&w);
        assert_eq!(z.name, "bias");
        assert_eq!(z.precision, Precision::Ternary);
        assert_eq!(z.data().unwrap(), &[0.0; 4]);
    }
}
