mod attribute;
mod schema;
mod walker;

pub use attribute::{DiscoveredRef, NONE_VALUE, Resolution, Resolver};
pub use schema::{SchemaEntry, SchemaOption, TraitSchema};
pub use walker::TraitGraphWalker;
