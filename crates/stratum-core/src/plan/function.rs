//! Scalar functions used by filter and project nodes.

use std::fmt;
use std::sync::Arc;

use crate::types::{FieldType, Value};

type FunctionImpl = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A named, typed scalar function.
#[derive(Clone)]
pub struct Function {
    name: String,
    return_type: FieldType,
    imp: FunctionImpl,
}

impl Function {
    /// Creates a function from a closure.
    pub fn new<F>(name: impl Into<String>, return_type: FieldType, f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            return_type,
            imp: Arc::new(f),
        }
    }

    /// Function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared return type.
    #[must_use]
    pub fn return_type(&self) -> &FieldType {
        &self.return_type
    }

    /// Applies the function.
    #[must_use]
    pub fn invoke(&self, args: &[Value]) -> Value {
        (self.imp)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(..) -> {}", self.name, self.return_type)
    }
}
