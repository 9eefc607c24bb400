//! Channel permission resolution for the invoking member.

pub const PERMISSION_ADMINISTRATOR: u64 = 1 << 3;
pub const PERMISSION_MANAGE_MESSAGES: u64 = 1 << 13;
const PERMISSION_ALL: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteKind {
    Role,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionOverwrite {
    pub id: u64,
    pub kind: OverwriteKind,
    pub allow: u64,
    pub deny: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPermissionInput<'a> {
    pub guild_id: u64,
    pub owner_id: u64,
    pub member_id: u64,
    pub member_roles: &'a [u64],
    /// `(role_id, permission bits)` for every guild role, including `@everyone`.
    pub role_permissions: &'a [(u64, u64)],
    pub channel_overwrites: &'a [PermissionOverwrite],
}

/// Guild-level permissions: `@everyone` plus the member's roles.
pub fn compute_base_permissions(input: &MemberPermissionInput<'_>) -> u64 {
    if input.member_id == input.owner_id {
        return PERMISSION_ALL;
    }
    let role_bits = |role_id: u64| {
        input
            .role_permissions
            .iter()
            .find(|(id, _)| *id == role_id)
            .map(|(_, bits)| *bits)
            .unwrap_or(0)
    };
    let mut permissions = role_bits(input.guild_id);
    for role in input.member_roles {
        permissions |= role_bits(*role);
    }
    if permissions & PERMISSION_ADMINISTRATOR != 0 {
        return PERMISSION_ALL;
    }
    permissions
}

/// Applies channel overwrites in Discord's order: `@everyone`, member roles
/// aggregated, then the member itself.
pub fn compute_channel_permissions(input: &MemberPermissionInput<'_>) -> u64 {
    let mut permissions = compute_base_permissions(input);
    if permissions == PERMISSION_ALL {
        return permissions;
    }

    if let Some(everyone) = input
        .channel_overwrites
        .iter()
        .find(|overwrite| overwrite.kind == OverwriteKind::Role && overwrite.id == input.guild_id)
    {
        permissions &= !everyone.deny;
        permissions |= everyone.allow;
    }

    let (mut allow, mut deny) = (0_u64, 0_u64);
    for overwrite in input.channel_overwrites.iter().filter(|overwrite| {
        overwrite.kind == OverwriteKind::Role
            && overwrite.id != input.guild_id
            && input.member_roles.contains(&overwrite.id)
    }) {
        allow |= overwrite.allow;
        deny |= overwrite.deny;
    }
    permissions &= !deny;
    permissions |= allow;

    if let Some(member) = input.channel_overwrites.iter().find(|overwrite| {
        overwrite.kind == OverwriteKind::Member && overwrite.id == input.member_id
    }) {
        permissions &= !member.deny;
        permissions |= member.allow;
    }
    permissions
}

pub fn can_manage_messages(input: &MemberPermissionInput<'_>) -> bool {
    compute_channel_permissions(input) & PERMISSION_MANAGE_MESSAGES != 0
}

#[cfg(test)]
mod tests {
    use super::{
        can_manage_messages, compute_base_permissions, MemberPermissionInput, OverwriteKind,
        PermissionOverwrite, PERMISSION_ADMINISTRATOR, PERMISSION_MANAGE_MESSAGES,
    };

    const GUILD: u64 = 100;
    const OWNER: u64 = 1;
    const MEMBER: u64 = 2;
    const MODERATORS: u64 = 300;

    fn input<'a>(
        member_roles: &'a [u64],
        role_permissions: &'a [(u64, u64)],
        channel_overwrites: &'a [PermissionOverwrite],
    ) -> MemberPermissionInput<'a> {
        MemberPermissionInput {
            guild_id: GUILD,
            owner_id: OWNER,
            member_id: MEMBER,
            member_roles,
            role_permissions,
            channel_overwrites,
        }
    }

    #[test]
    fn unit_owner_and_administrator_bypass_overwrites() {
        let deny_all = [PermissionOverwrite {
            id: GUILD,
            kind: OverwriteKind::Role,
            allow: 0,
            deny: PERMISSION_MANAGE_MESSAGES,
        }];
        let mut owner = input(&[], &[], &deny_all);
        owner.member_id = OWNER;
        assert!(can_manage_messages(&owner));

        let roles = [(GUILD, 0), (MODERATORS, PERMISSION_ADMINISTRATOR)];
        assert!(can_manage_messages(&input(&[MODERATORS], &roles, &deny_all)));
    }

    #[test]
    fn functional_role_grant_is_required_without_overwrites() {
        let roles = [(GUILD, 0), (MODERATORS, PERMISSION_MANAGE_MESSAGES)];
        assert!(!can_manage_messages(&input(&[], &roles, &[])));
        assert!(can_manage_messages(&input(&[MODERATORS], &roles, &[])));
        assert_eq!(
            compute_base_permissions(&input(&[MODERATORS], &roles, &[])),
            PERMISSION_MANAGE_MESSAGES
        );
    }

    #[test]
    fn functional_overwrites_apply_everyone_then_roles_then_member() {
        let roles = [(GUILD, PERMISSION_MANAGE_MESSAGES), (MODERATORS, 0)];
        let everyone_deny = PermissionOverwrite {
            id: GUILD,
            kind: OverwriteKind::Role,
            allow: 0,
            deny: PERMISSION_MANAGE_MESSAGES,
        };
        assert!(!can_manage_messages(&input(&[], &roles, &[everyone_deny])));

        let role_allow = PermissionOverwrite {
            id: MODERATORS,
            kind: OverwriteKind::Role,
            allow: PERMISSION_MANAGE_MESSAGES,
            deny: 0,
        };
        let overwrites = [everyone_deny, role_allow];
        assert!(can_manage_messages(&input(&[MODERATORS], &roles, &overwrites)));
        assert!(!can_manage_messages(&input(&[], &roles, &overwrites)));

        let member_deny = PermissionOverwrite {
            id: MEMBER,
            kind: OverwriteKind::Member,
            allow: 0,
            deny: PERMISSION_MANAGE_MESSAGES,
        };
        let overwrites = [everyone_deny, role_allow, member_deny];
        assert!(!can_manage_messages(&input(&[MODERATORS], &roles, &overwrites)));
    }
}
