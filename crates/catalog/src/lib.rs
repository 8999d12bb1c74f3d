//! Catalog: parts/tools that can be stocked and the locations that can hold them.

pub mod assignment;
pub mod location;
pub mod part;

pub use assignment::*;
pub use location::*;
pub use part::*;
