mod asset;
mod metadata;
mod traits;

pub use asset::{AssetPool, Candidate, Comparator, Restriction};
pub use metadata::{Attribute, Metadata, ResolvedAttribute};
pub use traits::{SCALAR_PRECISION, TraitKind, TraitSpec, TraitValue};
