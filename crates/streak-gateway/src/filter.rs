use std::collections::HashSet;

use uuid::Uuid;

use streak_db::Database;
use streak_types::events::FeedFilter;
use streak_types::models::{ConversationKey, Message};

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("not allowed to subscribe to {0}")]
    Forbidden(FeedFilter),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// A connection's filter together with the group memberships it was
/// resolved against.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveFilter {
    pub filter: FeedFilter,
    groups: HashSet<Uuid>,
}

impl ActiveFilter {
    pub fn admits(&self, message: &Message) -> bool {
        self.filter.matches(message, &self.groups)
    }

    /// Widen an inbox filter to a group joined after subscribing.
    pub fn joined_group(&mut self, group_id: Uuid) {
        if let FeedFilter::Inbox { .. } = self.filter {
            self.groups.insert(group_id);
        }
    }
}

/// Check that `user_id` may watch `filter` and resolve it for delivery.
/// Users may only watch their own inbox, their own direct threads and
/// groups they belong to.
pub fn authorize(db: &Database, user_id: Uuid, filter: FeedFilter) -> Result<ActiveFilter, SubscribeError> {
    let groups = match filter {
        FeedFilter::Inbox { user_id: owner } if owner == user_id => {
            db.group_ids_for_user(user_id)?.into_iter().collect()
        }
        FeedFilter::Direct { user_id: owner, .. } if owner == user_id => HashSet::new(),
        FeedFilter::Group { conversation_id }
            if db.is_member(ConversationKey::Group(conversation_id), user_id)? =>
        {
            HashSet::new()
        }
        _ => return Err(SubscribeError::Forbidden(filter)),
    };
    Ok(ActiveFilter { filter, groups })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use streak_types::models::Recipient;

    fn message(sender: Uuid, recipient: Recipient) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: sender,
            recipient,
            content: Some("done".into()),
            challenge_id: None,
            created_at: Utc::now(),
            read_at: None,
        }
    }

    fn setup() -> (Database, Uuid, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        db.create_user(&me.to_string(), "me", "x").unwrap();
        db.create_user(&peer.to_string(), "peer", "x").unwrap();
        let group = Uuid::new_v4();
        db.create_group(group, "runners", &[me, peer]).unwrap();
        (db, me, peer, group)
    }

    #[test]
    fn inbox_resolves_groups_and_admits_direct_traffic() {
        let (db, me, peer, group) = setup();
        let active = authorize(&db, me, FeedFilter::Inbox { user_id: me }).unwrap();

        assert!(active.admits(&message(peer, Recipient::User(me))));
        assert!(active.admits(&message(me, Recipient::User(peer))));
        assert!(active.admits(&message(peer, Recipient::Conversation(group))));
        assert!(!active.admits(&message(peer, Recipient::Conversation(Uuid::new_v4()))));
        assert!(!active.admits(&message(peer, Recipient::User(Uuid::new_v4()))));
    }

    #[test]
    fn joining_a_group_widens_inbox_only() {
        let (db, me, peer, _group) = setup();
        let later = Uuid::new_v4();
        let incoming = message(peer, Recipient::Conversation(later));

        let mut inbox = authorize(&db, me, FeedFilter::Inbox { user_id: me }).unwrap();
        assert!(!inbox.admits(&incoming));
        inbox.joined_group(later);
        assert!(inbox.admits(&incoming));

        let mut direct = authorize(&db, me, FeedFilter::Direct { user_id: me, peer_id: peer }).unwrap();
        direct.joined_group(later);
        assert!(!direct.admits(&incoming));
    }

    #[test]
    fn foreign_filters_are_forbidden() {
        let (db, me, peer, group) = setup();
        let outsider = Uuid::new_v4();

        assert!(matches!(
            authorize(&db, me, FeedFilter::Inbox { user_id: peer }),
            Err(SubscribeError::Forbidden(_))
        ));
        assert!(matches!(
            authorize(&db, me, FeedFilter::Direct { user_id: peer, peer_id: me }),
            Err(SubscribeError::Forbidden(_))
        ));
        assert!(matches!(
            authorize(&db, outsider, FeedFilter::Group { conversation_id: group }),
            Err(SubscribeError::Forbidden(_))
        ));
        assert!(authorize(&db, me, FeedFilter::Group { conversation_id: group }).is_ok());
    }
}
