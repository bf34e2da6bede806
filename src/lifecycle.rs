pub use self::effects::{EffectExecutor, EffectFailure, EffectReport, SideEffect};
pub use self::error::{ErrorKind, GENERIC_FAILURE_MESSAGE, LifecycleError};
pub use self::orchestrator::{CloseOptions, NewTicketRequest, TicketOrchestrator, TicketOutcome};
pub use self::state::{
    Change, Plan, REASON_CHANNEL_DELETED, REASON_INACTIVITY, REASON_MEMBER_LEFT,
    REASON_OPENER_APPROVED,
};

pub mod effects;
pub mod error;
pub mod orchestrator;
pub mod state;
