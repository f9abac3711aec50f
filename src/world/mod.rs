//! 世界状态层：角色、地点、物品、剧情节点、时间、增量与应用

pub mod apply;
pub mod delta;
pub mod model;
pub mod time;

pub use apply::{ApplyFailure, ApplyOutcome, ApplyPlan, ClassificationApplier};
pub use delta::{
    CharacterSnapshot, CreatedEntities, DeltaBuilder, ItemSnapshot, LocationSnapshot,
    PreviousState, StoryBeatSnapshot, WorldStateDelta,
};
pub use model::{
    new_id, BeatStatus, BeatType, Chapter, Character, CharacterPatch, CharacterStatus, EntityId,
    EntityKind, EntryType, Item, ItemPatch, Location, LocationPatch, Metadata, StoryBeat,
    StoryBeatPatch, StoryEntry, StoryEnvironment, StoryScope, WorldEntity, WorldView, INVENTORY,
};
pub use time::{TimeProgression, TimeTracker};
