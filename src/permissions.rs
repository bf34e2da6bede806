pub use self::flags::{
    DEFAULT_ROLE_TEMPLATES, PermissionFlags, RoleTemplate, has_all_permissions,
    has_any_permission, has_permission,
};
pub use self::pipeline::{
    Actor, ActorKind, AuthContext, AuthorizationPipeline, Decision, Operation, PermissionDenied,
    Rule, SYSTEM_ACTOR_ID,
};
pub use self::resolver::PermissionResolver;
pub use self::roles::RoleService;

mod flags;
mod pipeline;
mod resolver;
mod roles;
