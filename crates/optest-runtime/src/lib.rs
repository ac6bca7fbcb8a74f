pub mod baseline;
pub mod capability;
pub mod cast;
pub mod executor;
pub mod memory;
pub mod perf;
pub mod stride;

pub use baseline::*;
pub use capability::*;
pub use cast::*;
pub use executor::*;
pub use memory::*;
pub use perf::*;
pub use stride::*;
