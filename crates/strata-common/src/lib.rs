pub mod error;
pub mod identifier;

pub use error::{Error, Result};
pub use identifier::is_sql_identifier;
