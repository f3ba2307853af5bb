//! Values, identities and build keys shared by every layer.

mod id;
mod key;
mod value;

pub use id::Id;
pub use key::Key;
pub use value::{Field, FieldType, Value};
