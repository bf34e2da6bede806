use std::sync::Arc;

use tracing::debug;

use crate::config::PlatformConfig;
use crate::db::{DatabaseError, GuildRole, GuildStore, RoleStore};

use super::flags::PermissionFlags;
use super::pipeline::Actor;

fn union_of(roles: &[GuildRole]) -> PermissionFlags {
    roles
        .iter()
        .fold(PermissionFlags::empty(), |acc, role| {
            acc | PermissionFlags::from_stored(role.permissions)
        })
}

/// Resolves the effective permission set of a guild member.
pub struct PermissionResolver {
    guilds: Arc<dyn GuildStore>,
    roles: Arc<dyn RoleStore>,
    platform: PlatformConfig,
}

impl PermissionResolver {
    pub fn new(
        guilds: Arc<dyn GuildStore>,
        roles: Arc<dyn RoleStore>,
        platform: PlatformConfig,
    ) -> Self {
        Self {
            guilds,
            roles,
            platform,
        }
    }

    /// Union of every ticket role the user holds in the guild.
    ///
    /// A user with no roles, or a user id that is blank, resolves to the
    /// empty set rather than an error.
    pub async fn compute_user_permissions(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<PermissionFlags, DatabaseError> {
        if user_id.is_empty() {
            return Ok(PermissionFlags::empty());
        }
        let roles = self.roles.roles_for_member(guild_id, user_id).await?;
        Ok(union_of(&roles))
    }

    /// Like [`Self::compute_user_permissions`], also counting roles mirrored
    /// from the member's Discord roles.
    pub async fn compute_member_permissions(
        &self,
        guild_id: &str,
        user_id: &str,
        discord_role_ids: &[String],
    ) -> Result<PermissionFlags, DatabaseError> {
        let direct = self.compute_user_permissions(guild_id, user_id).await?;
        let mirrored = self
            .roles
            .roles_for_discord_roles(guild_id, discord_role_ids)
            .await?;
        Ok(direct | union_of(&mirrored))
    }

    /// Builds the actor for `user_id`, including owner and platform flags.
    pub async fn resolve_actor(
        &self,
        guild_id: &str,
        user_id: &str,
        discord_role_ids: &[String],
    ) -> Result<Actor, DatabaseError> {
        let permissions = self
            .compute_member_permissions(guild_id, user_id, discord_role_ids)
            .await?;
        let is_owner = self
            .guilds
            .get_guild(guild_id)
            .await?
            .is_some_and(|guild| guild.owner_id == user_id);
        let is_admin = self.platform.is_admin(user_id);

        debug!(
            "resolved actor guild_id={} user_id={} permissions={:#x} owner={} platform_admin={}",
            guild_id,
            user_id,
            permissions.bits(),
            is_owner,
            is_admin
        );

        Ok(Actor::user(user_id, permissions)
            .with_guild_owner(is_owner)
            .with_platform_admin(is_admin))
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::db::NewGuildRole;
    use crate::db::test_helpers::sqlite_manager;

    fn role(guild: &str, name: &str, flags: PermissionFlags, discord: Option<&str>) -> NewGuildRole {
        NewGuildRole {
            guild_id: guild.to_string(),
            name: name.to_string(),
            permissions: flags.bits(),
            is_default: false,
            discord_role_id: discord.map(str::to_string),
            position: 5,
        }
    }

    #[tokio::test]
    async fn permissions_are_the_union_of_held_roles() {
        let (_file, db) = sqlite_manager().await;
        db.guild_store().ensure_guild("g1", "owner").await.expect("guild");
        let roles = db.role_store();
        let a = roles
            .create_role(&role("g1", "a", PermissionFlags::TICKET_CLAIM, None))
            .await
            .expect("role a");
        let b = roles
            .create_role(&role("g1", "b", PermissionFlags::TAG_USE | PermissionFlags::TICKET_CLAIM, None))
            .await
            .expect("role b");
        roles.add_member(a.id, "u1", None).await.expect("assign a");
        roles.add_member(b.id, "u1", None).await.expect("assign b");

        let resolver = PermissionResolver::new(db.guild_store(), roles, PlatformConfig::default());
        let granted = resolver.compute_user_permissions("g1", "u1").await.expect("compute");
        assert_eq!(granted, PermissionFlags::TICKET_CLAIM | PermissionFlags::TAG_USE);

        let nobody = resolver.compute_user_permissions("g1", "u2").await.expect("compute");
        assert!(nobody.is_empty());
        let other_guild = resolver.compute_user_permissions("g2", "u1").await.expect("compute");
        assert!(other_guild.is_empty());
    }

    #[tokio::test]
    async fn mirrored_discord_roles_are_counted() {
        let (_file, db) = sqlite_manager().await;
        db.guild_store().ensure_guild("g1", "owner").await.expect("guild");
        db.role_store()
            .create_role(&role("g1", "mods", PermissionFlags::TICKET_CLOSE_ANY, Some("555")))
            .await
            .expect("role");

        let resolver = PermissionResolver::new(
            db.guild_store(),
            db.role_store(),
            PlatformConfig {
                admin_ids: vec!["root".to_string()],
            },
        );
        let actor = resolver
            .resolve_actor("g1", "u1", &["555".to_string(), "777".to_string()])
            .await
            .expect("actor");
        assert!(actor.has(PermissionFlags::TICKET_CLOSE_ANY));
        assert!(!actor.is_guild_owner);

        let owner = resolver.resolve_actor("g1", "owner", &[]).await.expect("owner");
        assert!(owner.is_guild_owner);
        assert!(owner.has(PermissionFlags::ROLE_DELETE));

        let root = resolver.resolve_actor("g1", "root", &[]).await.expect("root");
        assert!(root.is_platform_admin);
        assert!(root.permissions.is_empty());
    }
}
