//! Shared types for the Neotoma memory substrate: identifiers, the
//! source-priority ladder, content addressing, and the schema registry's
//! wire types. No storage or business logic lives here — see
//! `neotoma-storage` and `neotoma-core`.

mod content_hash;
mod error;
mod ids;
mod priority;
pub mod schema;

pub use content_hash::{CanonicalHash, ContentHash};
pub use error::{Error, ErrorTag, Result};
pub use ids::{EntityId, InterpretationId, ObservationId, SourceId, TimelineEventId, UserId};
pub use priority::SourcePriority;
pub use schema::{EntityType, SchemaDefinition, SchemaVersion};
