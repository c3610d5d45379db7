#![forbid(unsafe_code)]

use syncroom_domain::{Role, RoomId, UserId};
use syncroom_store::MembershipStore;

/// Actions priced by the authorization gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomAction<'a> {
	PostMessage,

	/// `author` is the message's stored author; `None` for assistant-authored
	/// messages, which only moderators may remove.
	DeleteMessage { author: Option<&'a UserId> },

	/// `owner` is the uploading user of record.
	DeleteFile { owner: &'a UserId },

	KickMember { target_role: Role },
	PromoteMember,
	DemoteMember,
	DeleteRoom,
}

/// Tagged authorization result consumed by straight-line pipeline code.
///
/// `Denied` is deliberately uniform: callers must not surface whether the
/// target resource exists to non-privileged members. Only complete
/// non-membership surfaces distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
	Authorized(Role),
	Denied,
	NotAMember,
}

/// Roles allowed to moderate content they do not own.
const MODERATORS: &[Role] = &[Role::Admin, Role::Owner];

/// Look up the member's current role and price the action against it. Role is
/// read per call, never cached, so role changes take effect immediately.
pub async fn authorize(
	membership: &dyn MembershipStore,
	room: &RoomId,
	user: &UserId,
	action: RoomAction<'_>,
) -> anyhow::Result<AuthDecision> {
	let Some(role) = membership.role_of(room, user).await? else {
		return Ok(AuthDecision::NotAMember);
	};

	let permitted = match action {
		RoomAction::PostMessage => true,

		// Author-or-role: authors can always retract their own content.
		RoomAction::DeleteMessage { author } => author == Some(user) || allowed(role, MODERATORS),
		RoomAction::DeleteFile { owner } => owner == user || allowed(role, MODERATORS),

		RoomAction::KickMember { target_role } => {
			allowed(role, MODERATORS) && (role == Role::Owner || target_role != Role::Owner)
		}

		RoomAction::PromoteMember | RoomAction::DemoteMember | RoomAction::DeleteRoom => {
			allowed(role, &[Role::Owner])
		}
	};

	if permitted {
		Ok(AuthDecision::Authorized(role))
	} else {
		Ok(AuthDecision::Denied)
	}
}

/// Explicit allow-set check.
fn allowed(role: Role, allow: &[Role]) -> bool {
	allow.contains(&role)
}
