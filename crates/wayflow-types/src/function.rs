//! Descriptors of callable functions.
//!
//! The handler itself is owned by the engine's function registry; these types
//! describe a function for listing and validation.

use serde::{Deserialize, Serialize};

use crate::scope::ValueType;

/// Declared parameter or result of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    /// Accepted types; empty means any.
    #[serde(default)]
    pub types: Vec<ValueType>,
    #[serde(default)]
    pub required: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, types: &[ValueType]) -> Self {
        Self {
            name: name.into(),
            types: types.to_vec(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Public description of a registered function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMeta {
    /// Unique reference (`ref` in step definitions).
    pub reference: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<Param>,
    #[serde(default)]
    pub results: Vec<Param>,
}

impl FunctionMeta {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            description: String::new(),
            parameters: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn result(mut self, param: Param) -> Self {
        self.results.push(param);
        self
    }

    /// Names of parameters marked as required.
    pub fn required_parameters(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
    }
}
