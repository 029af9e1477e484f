//! Knowledge layer: a categorized markdown corpus indexed for retrieval,
//! used both for retrieval-augmented prompting and as the sink for
//! evolution-generated artifacts.

pub mod record;
pub mod store;

pub use record::{CatalogEntry, Category, KnowledgeRecord};
pub use store::{apply_section_edit, KnowledgeFilter, KnowledgeStore, SectionOp, WriteOutcome};
