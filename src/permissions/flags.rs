use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Guild-scoped permission bits held by ticket roles.
    ///
    /// A member's effective set is the union of every role they hold. The
    /// layout is persisted as a signed 64-bit column, so bits must stay stable
    /// once released.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PermissionFlags: u64 {
        const PANEL_VIEW = 1 << 0;
        const PANEL_CREATE = 1 << 1;
        const PANEL_EDIT = 1 << 2;
        const PANEL_DELETE = 1 << 3;

        const TICKET_VIEW_ALL = 1 << 4;
        const TICKET_VIEW_ASSIGNED = 1 << 5;
        const TICKET_CLAIM = 1 << 6;
        const TICKET_ASSIGN = 1 << 7;
        const TICKET_CLOSE_ANY = 1 << 8;
        const TICKET_MANAGE_PARTICIPANTS = 1 << 9;
        const TICKET_AUTOCLOSE_MANAGE = 1 << 10;

        const ROLE_VIEW = 1 << 11;
        const ROLE_CREATE = 1 << 12;
        const ROLE_EDIT = 1 << 13;
        const ROLE_DELETE = 1 << 14;
        const ROLE_ASSIGN = 1 << 15;

        const MEMBER_VIEW = 1 << 16;
        const MEMBER_MANAGE = 1 << 17;

        const FORM_VIEW = 1 << 18;
        const FORM_CREATE = 1 << 19;
        const FORM_EDIT = 1 << 20;
        const FORM_DELETE = 1 << 21;

        const TAG_VIEW = 1 << 22;
        const TAG_USE = 1 << 23;
        const TAG_MANAGE = 1 << 24;

        const GUILD_SETTINGS_VIEW = 1 << 25;
        const GUILD_SETTINGS_EDIT = 1 << 26;

        const ANALYTICS_VIEW = 1 << 27;

        const FEEDBACK_VIEW = 1 << 28;
        const FEEDBACK_MANAGE = 1 << 29;
    }
}

impl PermissionFlags {
    pub const SUPPORT: Self = Self::TICKET_VIEW_ALL
        .union(Self::TICKET_CLAIM)
        .union(Self::TICKET_ASSIGN)
        .union(Self::TAG_VIEW)
        .union(Self::TAG_USE)
        .union(Self::MEMBER_VIEW);

    pub const VIEWER: Self = Self::ANALYTICS_VIEW
        .union(Self::GUILD_SETTINGS_VIEW)
        .union(Self::TICKET_VIEW_ALL);

    /// Reads a stored bitfield, dropping bits this build does not define.
    pub fn from_stored(bits: u64) -> Self {
        Self::from_bits_truncate(bits)
    }

    /// Comma-separated flag names, for user-facing messages.
    pub fn names(&self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        if names.is_empty() {
            "NONE".to_string()
        } else {
            names.join(", ")
        }
    }
}

pub fn has_permission(granted: PermissionFlags, flag: PermissionFlags) -> bool {
    granted.contains(flag)
}

pub fn has_any_permission(granted: PermissionFlags, flags: &[PermissionFlags]) -> bool {
    flags.iter().any(|flag| has_permission(granted, *flag))
}

pub fn has_all_permissions(granted: PermissionFlags, flags: &[PermissionFlags]) -> bool {
    flags.iter().all(|flag| has_permission(granted, *flag))
}

/// Role seeded into every guild at bootstrap.
#[derive(Debug, Clone, Copy)]
pub struct RoleTemplate {
    pub name: &'static str,
    pub permissions: PermissionFlags,
    pub position: i32,
}

pub const DEFAULT_ROLE_TEMPLATES: [RoleTemplate; 3] = [
    RoleTemplate {
        name: "admin",
        permissions: PermissionFlags::all(),
        position: 0,
    },
    RoleTemplate {
        name: "support",
        permissions: PermissionFlags::SUPPORT,
        position: 1,
    },
    RoleTemplate {
        name: "viewer",
        permissions: PermissionFlags::VIEWER,
        position: 2,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_flag_is_a_single_distinct_bit() {
        let mut seen = 0u64;
        for (name, flag) in PermissionFlags::all().iter_names() {
            let bits = flag.bits();
            assert_eq!(bits.count_ones(), 1, "{name} is not a single bit");
            assert_eq!(seen & bits, 0, "{name} overlaps another flag");
            seen |= bits;
        }
        assert_eq!(seen, PermissionFlags::all().bits());
    }

    #[test]
    fn admin_template_holds_everything() {
        let admin = DEFAULT_ROLE_TEMPLATES[0];
        assert_eq!(admin.name, "admin");
        assert_eq!(admin.permissions, PermissionFlags::all());
    }

    #[test]
    fn support_template_cannot_close_foreign_tickets() {
        assert!(has_permission(PermissionFlags::SUPPORT, PermissionFlags::TICKET_CLAIM));
        assert!(!has_permission(PermissionFlags::SUPPORT, PermissionFlags::TICKET_CLOSE_ANY));
        assert!(!has_permission(PermissionFlags::VIEWER, PermissionFlags::TICKET_CLAIM));
    }

    #[test]
    fn any_and_all_helpers() {
        let granted = PermissionFlags::TAG_VIEW | PermissionFlags::TAG_USE;
        assert!(has_any_permission(
            granted,
            &[PermissionFlags::TAG_MANAGE, PermissionFlags::TAG_USE]
        ));
        assert!(!has_all_permissions(
            granted,
            &[PermissionFlags::TAG_MANAGE, PermissionFlags::TAG_USE]
        ));
        assert!(has_all_permissions(granted, &[]));
    }

    #[test]
    fn stored_bits_outside_the_layout_are_dropped() {
        let stored = PermissionFlags::PANEL_VIEW.bits() | (1 << 63);
        assert_eq!(PermissionFlags::from_stored(stored), PermissionFlags::PANEL_VIEW);
    }

    #[test]
    fn names_lists_flags() {
        let flags = PermissionFlags::TICKET_CLOSE_ANY;
        assert_eq!(flags.names(), "TICKET_CLOSE_ANY");
        assert_eq!(PermissionFlags::empty().names(), "NONE");
    }
}
