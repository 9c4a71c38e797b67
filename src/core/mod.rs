pub mod error;
pub mod value;

pub use error::{DriverError, Error, MultiError, Result, TxOp, codes};
pub use value::Value;
