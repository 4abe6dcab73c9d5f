pub mod error;

pub use error::{ForwardError, ForwardErrorKind};
