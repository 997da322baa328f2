//! Per-page block tree storage.

mod events;
mod id;
mod page;
mod types;

pub use events::{BlockChange, BlockRecord, EventSubscription};
pub use id::{AutoIncrementGenerator, IdGenerator, UuidGenerator};
pub use page::{Page, PageState};
pub use types::{
    json_to_prop, prop_to_json, BlockView, PropValue, RefTarget, TextDelta, TextSpan,
};
