pub mod type_mapping;
pub use type_mapping::*;

pub mod property;
pub use property::*;

pub mod navigation;
pub use navigation::*;

pub mod complex_property;
pub use complex_property::*;

pub mod entity_type;
pub use entity_type::*;

pub mod model;
pub use model::*;
