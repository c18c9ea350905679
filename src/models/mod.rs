pub mod enums;
pub mod document;
pub mod loan;
pub mod metadata;

pub use document::*;
pub use loan::*;
pub use metadata::*;
