pub mod case;
pub mod criterion;
pub mod device;
pub mod dtype;
pub mod error;
pub mod op;
pub mod result;
pub mod tensor;

pub use case::*;
pub use criterion::*;
pub use device::*;
pub use dtype::*;
pub use error::*;
pub use op::*;
pub use result::*;
pub use tensor::*;
