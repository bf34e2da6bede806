use serde::Serialize;
use thiserror::Error;

use super::flags::{PermissionFlags, has_permission};

pub const SYSTEM_ACTOR_ID: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    User,
    System,
}

/// Identity and resolved permissions attributed to one operation.
///
/// Always passed explicitly; nothing in the core reads an ambient actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub permissions: PermissionFlags,
    pub is_guild_owner: bool,
    pub is_platform_admin: bool,
    pub kind: ActorKind,
}

impl Actor {
    pub fn user(user_id: impl Into<String>, permissions: PermissionFlags) -> Self {
        Self {
            user_id: user_id.into(),
            permissions,
            is_guild_owner: false,
            is_platform_admin: false,
            kind: ActorKind::User,
        }
    }

    /// Actor used by reconciliation and other automated triggers.
    pub fn system() -> Self {
        Self {
            user_id: SYSTEM_ACTOR_ID.to_string(),
            permissions: PermissionFlags::all(),
            is_guild_owner: false,
            is_platform_admin: false,
            kind: ActorKind::System,
        }
    }

    pub fn with_guild_owner(mut self, is_owner: bool) -> Self {
        self.is_guild_owner = is_owner;
        self
    }

    pub fn with_platform_admin(mut self, is_admin: bool) -> Self {
        self.is_platform_admin = is_admin;
        self
    }

    pub fn is_system(&self) -> bool {
        self.kind == ActorKind::System
    }

    /// True when the actor holds `flag`, counting the guild-owner bypass.
    pub fn has(&self, flag: PermissionFlags) -> bool {
        self.is_guild_owner || has_permission(self.permissions, flag)
    }
}

/// Operations gated by the authorization pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ViewTicket,
    CreateTicket,
    ClaimTicket,
    UnclaimTicket,
    TransferTicket,
    CloseTicket,
    RequestClose,
    ManageParticipants,
    ManageAutoclose,
    InitializeGuild,
    ViewRoles,
    CreateRole,
    EditRole,
    DeleteRole,
    AssignRole,
}

impl Operation {
    pub fn required(&self) -> PermissionFlags {
        match self {
            Operation::ViewTicket => PermissionFlags::TICKET_VIEW_ALL,
            Operation::CreateTicket => PermissionFlags::empty(),
            Operation::ClaimTicket => PermissionFlags::TICKET_CLAIM,
            Operation::UnclaimTicket | Operation::TransferTicket => PermissionFlags::TICKET_ASSIGN,
            Operation::CloseTicket | Operation::RequestClose => PermissionFlags::TICKET_CLOSE_ANY,
            Operation::ManageParticipants => PermissionFlags::TICKET_MANAGE_PARTICIPANTS,
            Operation::ManageAutoclose => PermissionFlags::TICKET_AUTOCLOSE_MANAGE,
            Operation::InitializeGuild => PermissionFlags::GUILD_SETTINGS_EDIT,
            Operation::ViewRoles => PermissionFlags::ROLE_VIEW,
            Operation::CreateRole => PermissionFlags::ROLE_CREATE,
            Operation::EditRole => PermissionFlags::ROLE_EDIT,
            Operation::DeleteRole => PermissionFlags::ROLE_DELETE,
            Operation::AssignRole => PermissionFlags::ROLE_ASSIGN,
        }
    }

    /// Operations platform administrators may run without guild permissions.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Operation::InitializeGuild)
    }
}

/// What a rule sees besides the actor.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub operation: Operation,
    /// Set by the caller when a ticket relationship (opener, claimer)
    /// grants the operation on its own.
    pub related_party: bool,
}

impl AuthContext {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            related_party: false,
        }
    }

    pub fn related(mut self, related: bool) -> Self {
        self.related_party = related;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(PermissionFlags),
    Abstain,
}

pub type Rule = fn(&Actor, &AuthContext) -> Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("missing permission: {}", .missing.names())]
pub struct PermissionDenied {
    pub missing: PermissionFlags,
}

fn guild_owner(actor: &Actor, _ctx: &AuthContext) -> Decision {
    if actor.is_guild_owner {
        Decision::Allow
    } else {
        Decision::Abstain
    }
}

fn related_party(_actor: &Actor, ctx: &AuthContext) -> Decision {
    if ctx.related_party {
        Decision::Allow
    } else {
        Decision::Abstain
    }
}

fn permission_bits(actor: &Actor, ctx: &AuthContext) -> Decision {
    if has_permission(actor.permissions, ctx.operation.required()) {
        Decision::Allow
    } else {
        Decision::Abstain
    }
}

fn platform_admin(actor: &Actor, ctx: &AuthContext) -> Decision {
    if actor.is_platform_admin && ctx.operation.is_bootstrap() {
        Decision::Allow
    } else {
        Decision::Abstain
    }
}

/// Ordered, short-circuiting list of authorization rules.
#[derive(Debug, Clone)]
pub struct AuthorizationPipeline {
    rules: Vec<Rule>,
}

impl Default for AuthorizationPipeline {
    fn default() -> Self {
        Self {
            rules: vec![guild_owner, related_party, permission_bits, platform_admin],
        }
    }
}

impl AuthorizationPipeline {
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// First non-abstaining rule wins; when every rule abstains the
    /// operation is denied with the flags the actor lacks.
    pub fn evaluate(&self, actor: &Actor, ctx: &AuthContext) -> Decision {
        for rule in &self.rules {
            match rule(actor, ctx) {
                Decision::Abstain => continue,
                decision => return decision,
            }
        }
        Decision::Deny(ctx.operation.required().difference(actor.permissions))
    }

    pub fn require(&self, actor: &Actor, ctx: &AuthContext) -> Result<(), PermissionDenied> {
        match self.evaluate(actor, ctx) {
            Decision::Allow => Ok(()),
            Decision::Deny(missing) => Err(PermissionDenied { missing }),
            Decision::Abstain => Err(PermissionDenied {
                missing: ctx.operation.required(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn pipeline() -> AuthorizationPipeline {
        AuthorizationPipeline::default()
    }

    #[test]
    fn guild_owner_bypasses_every_check() {
        let owner = Actor::user("owner", PermissionFlags::empty()).with_guild_owner(true);
        for operation in [
            Operation::ClaimTicket,
            Operation::CloseTicket,
            Operation::DeleteRole,
            Operation::InitializeGuild,
        ] {
            assert_eq!(pipeline().evaluate(&owner, &AuthContext::new(operation)), Decision::Allow);
        }
    }

    #[test_case(Operation::ClaimTicket, PermissionFlags::TICKET_CLAIM ; "claim")]
    #[test_case(Operation::TransferTicket, PermissionFlags::TICKET_ASSIGN ; "transfer")]
    #[test_case(Operation::CloseTicket, PermissionFlags::TICKET_CLOSE_ANY ; "close")]
    #[test_case(Operation::AssignRole, PermissionFlags::ROLE_ASSIGN ; "assign role")]
    fn missing_flag_is_reported(operation: Operation, flag: PermissionFlags) {
        let actor = Actor::user("u1", PermissionFlags::TAG_USE);
        let err = pipeline()
            .require(&actor, &AuthContext::new(operation))
            .unwrap_err();
        assert_eq!(err.missing, flag);

        let granted = Actor::user("u1", flag);
        assert!(pipeline().require(&granted, &AuthContext::new(operation)).is_ok());
    }

    #[test]
    fn zero_bitfield_fails_everything_but_unrestricted_operations() {
        let nobody = Actor::user("u1", PermissionFlags::empty());
        assert!(pipeline().require(&nobody, &AuthContext::new(Operation::CreateTicket)).is_ok());
        assert!(pipeline().require(&nobody, &AuthContext::new(Operation::ClaimTicket)).is_err());
        assert!(pipeline().require(&nobody, &AuthContext::new(Operation::ViewTicket)).is_err());
    }

    #[test]
    fn platform_admin_only_covers_bootstrap() {
        let admin = Actor::user("staff", PermissionFlags::empty()).with_platform_admin(true);
        assert!(pipeline().require(&admin, &AuthContext::new(Operation::InitializeGuild)).is_ok());
        assert!(pipeline().require(&admin, &AuthContext::new(Operation::CloseTicket)).is_err());
    }

    #[test]
    fn related_party_allows_without_flags() {
        let opener = Actor::user("opener", PermissionFlags::empty());
        let ctx = AuthContext::new(Operation::CloseTicket).related(true);
        assert!(pipeline().require(&opener, &ctx).is_ok());
    }

    #[test]
    fn custom_rule_order_short_circuits() {
        fn deny_all(_actor: &Actor, _ctx: &AuthContext) -> Decision {
            Decision::Deny(PermissionFlags::all())
        }
        let custom = AuthorizationPipeline::with_rules(vec![deny_all, guild_owner]);
        let owner = Actor::user("owner", PermissionFlags::empty()).with_guild_owner(true);
        assert_eq!(
            custom.evaluate(&owner, &AuthContext::new(Operation::ClaimTicket)),
            Decision::Deny(PermissionFlags::all())
        );
    }

    #[test]
    fn system_actor_holds_every_flag() {
        let system = Actor::system();
        assert!(system.is_system());
        assert!(system.has(PermissionFlags::TICKET_CLOSE_ANY));
    }
}
