pub mod media_item;
pub mod metadata;

pub use media_item::*;
pub use metadata::*;
