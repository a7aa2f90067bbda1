pub mod exception;
pub mod function_code;
pub mod points;
pub mod request;
pub mod response;

pub use exception::{ExceptionCode, ExceptionResponse};
pub use function_code::FunctionCode;
pub use points::TargetType;
#[cfg(feature = "alloc")]
pub use points::PointValues;
pub use request::*;
pub use response::*;
