//! Persisted entities: principals and the groups they belong to.

mod group;
mod user;

pub use group::{
    can_transition, Group, GroupSelection, MemberRow, Membership, STATE_APPROVED, STATE_BLOCKED,
    STATE_NOMINATED,
};
pub use user::{normalize_username, Principal};
