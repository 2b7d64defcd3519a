use std::sync::Arc;

use tracing::debug;

use crate::{
    db::{Group, UserId},
    hub::Hub,
    protocol::{MembershipAction, ServerEvent},
};

impl Hub {
    /// Tells `members` that `group` changed. Pass the membership after the
    /// change for `Added`/`Updated` and before it for `Removed`, so a removed
    /// member still hears about it.
    pub fn notify_membership(&self, action: MembershipAction, group: &Group, members: &[UserId]) {
        let targets = self.connections_of(members);
        debug!(
            group_id = group.id,
            ?action,
            members = members.len(),
            connections = targets.len(),
            "membership change"
        );
        let event = ServerEvent::GroupMembershipChanged {
            action,
            group: group.into(),
        };
        self.fan_out(targets, Arc::new(event));
    }
}
