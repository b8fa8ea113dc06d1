// Per-domain reconcilers. Each owns a private slice of state, subscribes
// only to its own push events, and exposes snapshots plus commands.

pub mod conversations;
pub mod friends;
pub mod notifications;
pub mod optimistic;
pub mod stories;

#[cfg(test)]
pub(crate) mod testing;

pub use conversations::{ActiveConversation, ConversationReconciler, Delivery, IncomingAlert};
pub use friends::{FriendGraph, FriendReconciler};
pub use notifications::{
    BadgeIndicator, NoBadge, Notification, NotificationKind, NotificationReconciler,
};
pub use optimistic::{MutationPhase, OptimisticMutation};
pub use stories::StoryReconciler;
