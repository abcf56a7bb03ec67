pub mod exemplars;
pub mod snapshot;

pub use exemplars::{Exemplar, ExemplarCatalog, SchemaError};
pub use snapshot::{ColumnSchema, ForeignKey, SchemaSnapshot, SchemaVersion, TableSchema};
