use std::sync::Arc;

use tracing::info;

use crate::db::{GuildRole, GuildSettings, GuildStore, NewGuildRole, RoleStore};
use crate::lifecycle::LifecycleError;

use super::flags::{DEFAULT_ROLE_TEMPLATES, PermissionFlags};
use super::pipeline::{Actor, AuthContext, AuthorizationPipeline, Operation};

const MAX_ROLE_NAME_LEN: usize = 100;

/// Guild bootstrap and ticket-role administration.
pub struct RoleService {
    guilds: Arc<dyn GuildStore>,
    roles: Arc<dyn RoleStore>,
    pipeline: AuthorizationPipeline,
}

impl RoleService {
    pub fn new(
        guilds: Arc<dyn GuildStore>,
        roles: Arc<dyn RoleStore>,
        pipeline: AuthorizationPipeline,
    ) -> Self {
        Self {
            guilds,
            roles,
            pipeline,
        }
    }

    fn authorize(&self, actor: &Actor, operation: Operation) -> Result<(), LifecycleError> {
        self.pipeline.require(actor, &AuthContext::new(operation))?;
        Ok(())
    }

    /// Upserts guild settings and the default roles. Safe to call repeatedly.
    pub async fn initialize_guild(
        &self,
        actor: &Actor,
        guild_id: &str,
        owner_id: &str,
    ) -> Result<(GuildSettings, Vec<GuildRole>), LifecycleError> {
        if guild_id.is_empty() || owner_id.is_empty() {
            return Err(LifecycleError::Validation(
                "guild id and owner id are required".to_string(),
            ));
        }
        self.authorize(actor, Operation::InitializeGuild)?;

        let settings = self.guilds.ensure_guild(guild_id, owner_id).await?;
        let mut defaults = Vec::with_capacity(DEFAULT_ROLE_TEMPLATES.len());
        for template in DEFAULT_ROLE_TEMPLATES {
            let role = self
                .roles
                .ensure_default_role(&NewGuildRole {
                    guild_id: guild_id.to_string(),
                    name: template.name.to_string(),
                    permissions: template.permissions.bits(),
                    is_default: true,
                    discord_role_id: None,
                    position: template.position,
                })
                .await?;
            defaults.push(role);
        }

        info!(
            "guild initialized guild_id={} owner_id={} actor={}",
            guild_id, owner_id, actor.user_id
        );
        Ok((settings, defaults))
    }

    pub async fn list_roles(
        &self,
        actor: &Actor,
        guild_id: &str,
    ) -> Result<Vec<GuildRole>, LifecycleError> {
        self.authorize(actor, Operation::ViewRoles)?;
        Ok(self.roles.list_roles(guild_id).await?)
    }

    pub async fn create_role(
        &self,
        actor: &Actor,
        guild_id: &str,
        name: &str,
        permissions: PermissionFlags,
        discord_role_id: Option<&str>,
        position: i32,
    ) -> Result<GuildRole, LifecycleError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_ROLE_NAME_LEN {
            return Err(LifecycleError::Validation(format!(
                "role name must be 1 to {MAX_ROLE_NAME_LEN} characters"
            )));
        }
        self.authorize(actor, Operation::CreateRole)?;

        let role = self
            .roles
            .create_role(&NewGuildRole {
                guild_id: guild_id.to_string(),
                name: name.to_string(),
                permissions: permissions.bits(),
                is_default: false,
                discord_role_id: discord_role_id.map(str::to_string),
                position,
            })
            .await?;
        info!(
            "role created guild_id={} role_id={} name={} actor={}",
            guild_id, role.id, role.name, actor.user_id
        );
        Ok(role)
    }

    /// Loads a role and checks it belongs to `guild_id`.
    async fn guild_role(&self, guild_id: &str, role_id: i64) -> Result<GuildRole, LifecycleError> {
        match self.roles.get_role(role_id).await? {
            Some(role) if role.guild_id == guild_id => Ok(role),
            _ => Err(LifecycleError::NotFound("role".to_string())),
        }
    }

    pub async fn update_role_permissions(
        &self,
        actor: &Actor,
        guild_id: &str,
        role_id: i64,
        permissions: PermissionFlags,
    ) -> Result<GuildRole, LifecycleError> {
        self.authorize(actor, Operation::EditRole)?;
        let mut role = self.guild_role(guild_id, role_id).await?;
        role.permissions = permissions.bits();
        role.updated_at = chrono::Utc::now();
        self.roles.update_role(&role).await?;
        info!(
            "role permissions updated guild_id={} role_id={} permissions={:#x} actor={}",
            guild_id, role_id, role.permissions, actor.user_id
        );
        Ok(role)
    }

    pub async fn delete_role(
        &self,
        actor: &Actor,
        guild_id: &str,
        role_id: i64,
    ) -> Result<(), LifecycleError> {
        self.authorize(actor, Operation::DeleteRole)?;
        let role = self.guild_role(guild_id, role_id).await?;
        if role.is_default {
            return Err(LifecycleError::Validation(format!(
                "default role {} cannot be deleted",
                role.name
            )));
        }
        self.roles.delete_role(role_id).await?;
        info!(
            "role deleted guild_id={} role_id={} actor={}",
            guild_id, role_id, actor.user_id
        );
        Ok(())
    }

    /// Returns `false` when the user already held the role.
    pub async fn assign_role(
        &self,
        actor: &Actor,
        guild_id: &str,
        role_id: i64,
        user_id: &str,
    ) -> Result<bool, LifecycleError> {
        if user_id.is_empty() {
            return Err(LifecycleError::Validation("user id is required".to_string()));
        }
        self.authorize(actor, Operation::AssignRole)?;
        self.guild_role(guild_id, role_id).await?;
        let assigned_by = (!actor.is_system()).then_some(actor.user_id.as_str());
        Ok(self.roles.add_member(role_id, user_id, assigned_by).await?)
    }

    /// Returns `false` when the user did not hold the role.
    pub async fn revoke_role(
        &self,
        actor: &Actor,
        guild_id: &str,
        role_id: i64,
        user_id: &str,
    ) -> Result<bool, LifecycleError> {
        self.authorize(actor, Operation::AssignRole)?;
        self.guild_role(guild_id, role_id).await?;
        Ok(self.roles.remove_member(role_id, user_id).await?)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::db::DatabaseManager;
    use crate::db::test_helpers::sqlite_manager;

    fn service(db: &DatabaseManager) -> RoleService {
        RoleService::new(db.guild_store(), db.role_store(), AuthorizationPipeline::default())
    }

    #[tokio::test]
    async fn initialize_guild_is_idempotent() {
        let (_file, db) = sqlite_manager().await;
        let roles = service(&db);
        let system = Actor::system();

        let (settings, first) = roles
            .initialize_guild(&system, "g1", "owner")
            .await
            .expect("first init");
        assert_eq!(settings.owner_id, "owner");
        assert_eq!(first.len(), 3);

        let (_, second) = roles
            .initialize_guild(&system, "g1", "owner")
            .await
            .expect("second init");
        let first_ids: Vec<i64> = first.iter().map(|r| r.id).collect();
        let second_ids: Vec<i64> = second.iter().map(|r| r.id).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(db.role_store().list_roles("g1").await.expect("list").len(), 3);

        let admin = db
            .role_store()
            .find_default_role("g1", "admin")
            .await
            .expect("query")
            .expect("admin role");
        assert_eq!(PermissionFlags::from_stored(admin.permissions), PermissionFlags::all());
    }

    #[tokio::test]
    async fn platform_admin_may_bootstrap_but_not_manage_roles() {
        let (_file, db) = sqlite_manager().await;
        let roles = service(&db);
        let admin = Actor::user("root", PermissionFlags::empty()).with_platform_admin(true);

        roles
            .initialize_guild(&admin, "g1", "owner")
            .await
            .expect("bootstrap allowed");
        let err = roles
            .create_role(&admin, "g1", "helpers", PermissionFlags::TICKET_CLAIM, None, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PermissionDenied(denied) if denied.missing == PermissionFlags::ROLE_CREATE));
    }

    #[tokio::test]
    async fn default_roles_cannot_be_deleted() {
        let (_file, db) = sqlite_manager().await;
        let roles = service(&db);
        let owner = Actor::user("owner", PermissionFlags::empty()).with_guild_owner(true);
        let (_, defaults) = roles
            .initialize_guild(&owner, "g1", "owner")
            .await
            .expect("init");

        let err = roles.delete_role(&owner, "g1", defaults[1].id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));

        let custom = roles
            .create_role(&owner, "g1", "triage", PermissionFlags::TICKET_CLAIM, None, 3)
            .await
            .expect("create");
        roles.delete_role(&owner, "g1", custom.id).await.expect("delete custom");
        assert!(db.role_store().get_role(custom.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn assignment_round_trip_and_foreign_guild_roles() {
        let (_file, db) = sqlite_manager().await;
        let roles = service(&db);
        let manager = Actor::user("lead", PermissionFlags::ROLE_ASSIGN | PermissionFlags::ROLE_EDIT);
        let (_, defaults) = roles
            .initialize_guild(&Actor::system(), "g1", "owner")
            .await
            .expect("init");
        let support = defaults[1].id;

        assert!(roles.assign_role(&manager, "g1", support, "u1").await.expect("assign"));
        assert!(!roles.assign_role(&manager, "g1", support, "u1").await.expect("again"));
        let members = db.role_store().list_members(support).await.expect("members");
        assert_eq!(members[0].assigned_by_id.as_deref(), Some("lead"));

        let err = roles.assign_role(&manager, "g2", support, "u1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));

        let updated = roles
            .update_role_permissions(&manager, "g1", support, PermissionFlags::TAG_USE)
            .await
            .expect("update");
        assert_eq!(updated.permissions, PermissionFlags::TAG_USE.bits());

        assert!(roles.revoke_role(&manager, "g1", support, "u1").await.expect("revoke"));
        assert!(!roles.revoke_role(&manager, "g1", support, "u1").await.expect("revoke again"));
    }

    #[tokio::test]
    async fn blank_role_name_is_rejected_before_auth() {
        let (_file, db) = sqlite_manager().await;
        let roles = service(&db);
        let nobody = Actor::user("u1", PermissionFlags::empty());
        let err = roles
            .create_role(&nobody, "g1", "   ", PermissionFlags::empty(), None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }
}
