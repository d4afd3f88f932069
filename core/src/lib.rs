pub mod album;
pub mod comments;
pub mod dedup;
pub mod executor;
pub mod lifecycle;
pub mod model;
pub mod pacing;
pub mod platform;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod settings;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod worker;

pub use lifecycle::{ConnectOutcome, Engine, LifecycleState, StartReport};
pub use model::{
    AccountId, ActionFingerprint, ActionKind, ActionPayload, ChatId, InboundEvent,
    IncomingMessage, MessageId, MessageKey, PendingAction,
};
pub use platform::{
    ClientConnector, EventSink, InvalidReason, PlatformClient, PlatformError, TextGenerator,
};
pub use policy::{DelayRange, ReactionPolicy};
pub use settings::EngineSettings;
