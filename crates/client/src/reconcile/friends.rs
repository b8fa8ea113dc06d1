// Friend-graph reconciler: confirmed friends, incoming requests, and the
// users we have sent requests to. Mutations are optimistic and rolled back
// when the command fails; `friend_accepted` pushes update the same lists.

use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use feedsync_common::protocol::envelope::EventType;
use feedsync_common::types::{FriendRequest, FriendRequestId, UserId, UserSummary};

use crate::api::{CommandError, CommandResult, FriendsApi};
use crate::reconcile::optimistic::{lock, OptimisticMutation};
use crate::registry::{Subscription, SubscriptionRegistry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FriendGraph {
    pub friends: Vec<UserSummary>,
    pub incoming: Vec<FriendRequest>,
    /// Users with a request from us still awaiting an answer.
    pub outgoing: Vec<UserId>,
}

impl FriendGraph {
    fn add_friend(&mut self, friend: UserSummary) {
        match self.friends.iter_mut().find(|f| f.id == friend.id) {
            Some(existing) => *existing = friend,
            None => self.friends.push(friend),
        }
    }

    pub fn is_friend(&self, user_id: UserId) -> bool {
        self.friends.iter().any(|f| f.id == user_id)
    }
}

#[derive(Deserialize)]
struct FriendAccepted {
    friend: UserSummary,
}

struct Inner {
    api: Arc<dyn FriendsApi>,
    state: Mutex<FriendGraph>,
}

impl Inner {
    fn on_friend_accepted(&self, data: &Value) -> anyhow::Result<()> {
        let FriendAccepted { friend } = serde_json::from_value(data.clone())
            .context("invalid friend_accepted payload")?;
        debug!(friend_id = friend.id, "friend request accepted remotely");
        let mut graph = lock(&self.state);
        graph.outgoing.retain(|id| *id != friend.id);
        graph.add_friend(friend);
        Ok(())
    }
}

pub struct FriendReconciler {
    inner: Arc<Inner>,
    subscriptions: Vec<Subscription>,
}

impl FriendReconciler {
    pub fn new(api: Arc<dyn FriendsApi>, registry: &SubscriptionRegistry) -> Self {
        let inner = Arc::new(Inner { api, state: Mutex::new(FriendGraph::default()) });
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let subscription =
            registry.subscribe(EventType::FriendAccepted.as_str(), move |data| {
                match weak.upgrade() {
                    Some(inner) => inner.on_friend_accepted(data),
                    None => Ok(()),
                }
            });
        Self { inner, subscriptions: vec![subscription] }
    }

    pub fn graph(&self) -> FriendGraph {
        lock(&self.inner.state).clone()
    }

    /// Refetch friends and pending requests and replace both lists.
    pub async fn refresh(&self) -> CommandResult<()> {
        let (friends, incoming) =
            tokio::try_join!(self.inner.api.friends(), self.inner.api.pending_requests())?;
        let mut graph = lock(&self.inner.state);
        info!(friends = friends.len(), incoming = incoming.len(), "friend graph refreshed");
        graph.friends = friends;
        graph.incoming = incoming;
        Ok(())
    }

    pub async fn send_request(&self, user_id: UserId) -> CommandResult<()> {
        {
            let graph = lock(&self.inner.state);
            if graph.is_friend(user_id) || graph.outgoing.contains(&user_id) {
                return Err(CommandError::Invalid(format!(
                    "a request to user {user_id} is not possible"
                )));
            }
        }
        OptimisticMutation::new("send_friend_request")
            .run(
                &self.inner.state,
                |graph| graph.outgoing.push(user_id),
                self.inner.api.send_request(user_id),
                |_, _| {},
                |graph, _| graph.outgoing.retain(|id| *id != user_id),
            )
            .await
            .inspect_err(|error| warn!(user_id, %error, "friend request failed"))
    }

    /// Accept an incoming request. The requester shows up as a friend
    /// immediately and is replaced by the server's record on success.
    pub async fn accept_request(&self, request_id: FriendRequestId) -> CommandResult<UserSummary> {
        let (index, request) = self.find_request(request_id)?;
        let requester = request.from_user.id;
        let already_friend = lock(&self.inner.state).is_friend(requester);

        OptimisticMutation::new("accept_friend_request")
            .run(
                &self.inner.state,
                |graph| {
                    graph.incoming.retain(|r| r.id != request_id);
                    graph.add_friend(request.from_user.clone());
                },
                self.inner.api.accept_request(request_id),
                |graph, friend| graph.add_friend(friend.clone()),
                |graph, _| {
                    if !already_friend {
                        graph.friends.retain(|f| f.id != requester);
                    }
                    restore_request(graph, index, request.clone());
                },
            )
            .await
            .inspect_err(|error| warn!(request_id, %error, "accepting friend request failed"))
    }

    pub async fn decline_request(&self, request_id: FriendRequestId) -> CommandResult<()> {
        let (index, request) = self.find_request(request_id)?;
        OptimisticMutation::new("decline_friend_request")
            .run(
                &self.inner.state,
                |graph| graph.incoming.retain(|r| r.id != request_id),
                self.inner.api.decline_request(request_id),
                |_, _| {},
                |graph, _| restore_request(graph, index, request.clone()),
            )
            .await
            .inspect_err(|error| warn!(request_id, %error, "declining friend request failed"))
    }

    pub async fn remove_friend(&self, user_id: UserId) -> CommandResult<()> {
        let (index, friend) = {
            let graph = lock(&self.inner.state);
            graph
                .friends
                .iter()
                .position(|f| f.id == user_id)
                .map(|index| (index, graph.friends[index].clone()))
                .ok_or_else(|| CommandError::Invalid(format!("user {user_id} is not a friend")))?
        };
        OptimisticMutation::new("remove_friend")
            .run(
                &self.inner.state,
                |graph| graph.friends.retain(|f| f.id != user_id),
                self.inner.api.remove_friend(user_id),
                |_, _| {},
                |graph, _| {
                    if !graph.is_friend(user_id) {
                        let index = index.min(graph.friends.len());
                        graph.friends.insert(index, friend.clone());
                    }
                },
            )
            .await
            .inspect_err(|error| warn!(user_id, %error, "removing friend failed"))
    }

    fn find_request(&self, request_id: FriendRequestId) -> CommandResult<(usize, FriendRequest)> {
        let graph = lock(&self.inner.state);
        graph
            .incoming
            .iter()
            .position(|r| r.id == request_id)
            .map(|index| (index, graph.incoming[index].clone()))
            .ok_or_else(|| CommandError::Invalid(format!("unknown friend request {request_id}")))
    }

    pub fn reset(&mut self) {
        self.subscriptions.clear();
        *lock(&self.inner.state) = FriendGraph::default();
    }
}

fn restore_request(graph: &mut FriendGraph, index: usize, request: FriendRequest) {
    if graph.incoming.iter().all(|r| r.id != request.id) {
        let index = index.min(graph.incoming.len());
        graph.incoming.insert(index, request);
    }
}
