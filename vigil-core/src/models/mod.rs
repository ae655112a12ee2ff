pub mod event;
pub mod fields;
pub mod item;
pub mod record;

pub use event::EventCategory;
pub use fields::{EnrichedFields, Field, ResolvedFields, Scored};
pub use item::{MessageKey, RawItem, TranslationResult};
pub use record::{NewRecord, StoredRecord};
