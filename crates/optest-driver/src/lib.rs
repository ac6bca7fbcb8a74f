pub mod case;
pub mod codec;
pub mod evaluator;
pub mod ops;
pub mod registry;
pub mod runner;
pub mod store;

pub use case::*;
pub use evaluator::*;
pub use ops::*;
pub use registry::*;
pub use runner::*;
pub use store::*;
