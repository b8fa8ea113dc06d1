// Story reconciler: story groups per author plus the per-user viewed set.
//
// The viewed set is restored from the durable cache at construction, only
// grows during playback, and loses entries only when a story is deleted.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use feedsync_common::types::{
    Reaction, ReactionCounts, Story, StoryDraft, StoryGroup, StoryId, UserId, UserSummary,
};

use crate::api::{CommandError, CommandResult, StoriesApi};
use crate::cache::{CacheKey, LocalCache};
use crate::reconcile::optimistic::{lock, OptimisticMutation};

#[derive(Debug, Default)]
struct StoryState {
    groups: Vec<StoryGroup>,
    /// Insertion order, no duplicates.
    viewed: Vec<StoryId>,
}

impl StoryState {
    fn story_mut(&mut self, story_id: StoryId) -> Option<&mut Story> {
        self.groups
            .iter_mut()
            .flat_map(|group| group.stories.iter_mut())
            .find(|story| story.id == story_id)
    }

    fn set_reaction(
        &mut self,
        story_id: StoryId,
        reaction: Option<Reaction>,
        counts: ReactionCounts,
    ) {
        if let Some(story) = self.story_mut(story_id) {
            story.user_reaction = reaction;
            story.reactions = counts;
        }
    }
}

fn adjust(counts: &mut ReactionCounts, reaction: Reaction, up: bool) {
    let slot = match reaction {
        Reaction::Heart => &mut counts.heart,
        Reaction::Thunder => &mut counts.thunder,
    };
    *slot = if up { slot.saturating_add(1) } else { slot.saturating_sub(1) };
}

pub struct StoryReconciler {
    me: UserId,
    api: Arc<dyn StoriesApi>,
    cache: LocalCache,
    key: CacheKey,
    state: Mutex<StoryState>,
}

impl StoryReconciler {
    pub fn new(me: UserId, api: Arc<dyn StoriesApi>, cache: LocalCache) -> Self {
        let key = CacheKey::ViewedStories(me);
        let mut viewed: Vec<StoryId> = Vec::new();
        for id in cache.load_list::<StoryId>(&key) {
            if !viewed.contains(&id) {
                viewed.push(id);
            }
        }
        debug!(restored = viewed.len(), "viewed stories restored");
        Self { me, api, cache, key, state: Mutex::new(StoryState { groups: Vec::new(), viewed }) }
    }

    pub async fn refresh(&self) -> CommandResult<()> {
        let groups = self.api.stories().await?;
        info!(groups = groups.len(), "stories refreshed");
        lock(&self.state).groups = groups;
        Ok(())
    }

    pub fn groups(&self) -> Vec<StoryGroup> {
        lock(&self.state).groups.clone()
    }

    pub fn my_stories(&self) -> Option<StoryGroup> {
        lock(&self.state).groups.iter().find(|g| g.user_id == self.me).cloned()
    }

    pub fn friend_stories(&self) -> Vec<StoryGroup> {
        lock(&self.state).groups.iter().filter(|g| g.user_id != self.me).cloned().collect()
    }

    pub fn is_viewed(&self, story_id: StoryId) -> bool {
        lock(&self.state).viewed.contains(&story_id)
    }

    pub fn viewed_story_ids(&self) -> Vec<StoryId> {
        lock(&self.state).viewed.clone()
    }

    /// Whether every story in `group` has been viewed.
    pub fn group_fully_viewed(&self, group: &StoryGroup) -> bool {
        let state = lock(&self.state);
        group.stories.iter().all(|story| state.viewed.contains(&story.id))
    }

    pub async fn create_story(&self, draft: &StoryDraft) -> CommandResult<Story> {
        if draft.media_url.trim().is_empty() {
            return Err(CommandError::Invalid("story media is required".to_string()));
        }
        let story = self.api.create_story(draft).await?;
        let mut state = lock(&self.state);
        match state.groups.iter_mut().find(|g| g.user_id == self.me) {
            Some(group) => group.stories.insert(0, story.clone()),
            None => state.groups.insert(
                0,
                StoryGroup {
                    user_id: self.me,
                    user: UserSummary::new(self.me, String::new()),
                    stories: vec![story.clone()],
                },
            ),
        }
        info!(story_id = story.id, "story created");
        Ok(story)
    }

    /// Record a view locally and durably, then tell the server. A failed
    /// command keeps the local view.
    pub async fn mark_viewed(&self, story_id: StoryId) {
        {
            let mut state = lock(&self.state);
            if state.viewed.contains(&story_id) {
                return;
            }
            state.viewed.push(story_id);
            self.cache.trim_to_bound(&self.key, &mut state.viewed);
            self.cache.store_list(&self.key, &state.viewed);
        }
        if let Err(error) = self.api.mark_viewed(story_id).await {
            warn!(story_id, %error, "marking story viewed failed");
        }
    }

    pub async fn react(
        &self,
        story_id: StoryId,
        reaction: Reaction,
    ) -> CommandResult<ReactionCounts> {
        let (previous, counts) = self.reaction_of(story_id)?;
        OptimisticMutation::new("react_story")
            .run(
                &self.state,
                |state| {
                    let mut next = counts;
                    if let Some(previous) = previous {
                        adjust(&mut next, previous, false);
                    }
                    adjust(&mut next, reaction, true);
                    state.set_reaction(story_id, Some(reaction), next);
                },
                self.api.react(story_id, reaction),
                |state, confirmed| state.set_reaction(story_id, Some(reaction), *confirmed),
                |state, _| state.set_reaction(story_id, previous, counts),
            )
            .await
            .inspect_err(|error| warn!(story_id, %error, "story reaction failed"))
    }

    pub async fn remove_reaction(&self, story_id: StoryId) -> CommandResult<ReactionCounts> {
        let (previous, counts) = self.reaction_of(story_id)?;
        OptimisticMutation::new("remove_story_reaction")
            .run(
                &self.state,
                |state| {
                    let mut next = counts;
                    if let Some(previous) = previous {
                        adjust(&mut next, previous, false);
                    }
                    state.set_reaction(story_id, None, next);
                },
                self.api.remove_reaction(story_id),
                |state, confirmed| state.set_reaction(story_id, None, *confirmed),
                |state, _| state.set_reaction(story_id, previous, counts),
            )
            .await
            .inspect_err(|error| warn!(story_id, %error, "removing story reaction failed"))
    }

    /// Delete one of our stories. On success it leaves its group (empty
    /// groups are dropped) and the viewed set.
    pub async fn delete_story(&self, story_id: StoryId) -> CommandResult<()> {
        self.api.delete_story(story_id).await?;
        let mut state = lock(&self.state);
        for group in &mut state.groups {
            group.stories.retain(|story| story.id != story_id);
        }
        state.groups.retain(|group| !group.stories.is_empty());
        if state.viewed.contains(&story_id) {
            state.viewed.retain(|id| *id != story_id);
            self.cache.store_list(&self.key, &state.viewed);
        }
        info!(story_id, "story deleted");
        Ok(())
    }

    fn reaction_of(&self, story_id: StoryId) -> CommandResult<(Option<Reaction>, ReactionCounts)> {
        lock(&self.state)
            .story_mut(story_id)
            .map(|story| (story.user_reaction, story.reactions))
            .ok_or_else(|| CommandError::Invalid(format!("unknown story {story_id}")))
    }

    pub fn reset(&self) {
        lock(&self.state).groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::reconcile::testing::{group, MockStories};
    use feedsync_common::types::MediaType;

    const ME: UserId = 1;

    fn memory_cache() -> LocalCache {
        LocalCache::open_in_memory(&CacheConfig::default()).unwrap()
    }

    async fn loaded(api: &Arc<MockStories>, cache: &LocalCache) -> StoryReconciler {
        let reconciler = StoryReconciler::new(ME, api.clone(), cache.clone());
        reconciler.refresh().await.unwrap();
        reconciler
    }

    fn api_with_groups() -> Arc<MockStories> {
        let api = Arc::new(MockStories::default());
        *api.groups.lock().unwrap() = vec![group(ME, &[1]), group(2, &[20, 21]), group(3, &[30])];
        api
    }

    #[tokio::test]
    async fn split_mine_from_friends() {
        let api = api_with_groups();
        let reconciler = loaded(&api, &memory_cache()).await;
        assert_eq!(reconciler.my_stories().unwrap().stories.len(), 1);
        let friends: Vec<_> = reconciler.friend_stories().iter().map(|g| g.user_id).collect();
        assert_eq!(friends, vec![2, 3]);
    }

    #[tokio::test]
    async fn mark_viewed_is_deduplicated_and_persisted() {
        let api = api_with_groups();
        let cache = memory_cache();
        let reconciler = loaded(&api, &cache).await;

        reconciler.mark_viewed(20).await;
        reconciler.mark_viewed(20).await;
        reconciler.mark_viewed(21).await;
        assert_eq!(api.calls(), vec!["view:20", "view:21"]);
        assert!(reconciler.group_fully_viewed(&reconciler.friend_stories()[0]));

        let reloaded = StoryReconciler::new(ME, api.clone(), cache);
        assert_eq!(reloaded.viewed_story_ids(), vec![20, 21]);
    }

    #[tokio::test]
    async fn viewed_set_keeps_most_recent_within_bound() {
        let api = api_with_groups();
        let config = CacheConfig { max_viewed_stories: 2, ..CacheConfig::default() };
        let cache = LocalCache::open_in_memory(&config).unwrap();
        let reconciler = loaded(&api, &cache).await;

        for id in [20, 21, 30] {
            reconciler.mark_viewed(id).await;
        }
        assert_eq!(reconciler.viewed_story_ids(), vec![21, 30]);
        assert!(!reconciler.is_viewed(20));

        let reloaded = StoryReconciler::new(ME, api.clone(), cache);
        assert_eq!(reloaded.viewed_story_ids(), reconciler.viewed_story_ids());
    }

    #[tokio::test]
    async fn failed_view_command_keeps_local_view() {
        let api = api_with_groups();
        api.fail_commands(CommandError::Network("offline".into()));
        let reconciler = loaded(&api, &memory_cache()).await;
        reconciler.mark_viewed(30).await;
        assert!(reconciler.is_viewed(30));
    }

    #[tokio::test]
    async fn react_is_optimistic_then_uses_server_counts() {
        let api = api_with_groups();
        let reconciler = Arc::new(loaded(&api, &memory_cache()).await);

        let gate = api.gate_commands();
        let reacting = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.react(20, Reaction::Heart).await }
        });
        let story = |r: &StoryReconciler| r.friend_stories()[0].stories[0].clone();
        while story(reconciler.as_ref()).user_reaction.is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(story(reconciler.as_ref()).reactions.heart, 1);

        gate.send(()).unwrap();
        reacting.await.unwrap().unwrap();
        assert_eq!(story(reconciler.as_ref()).reactions, ReactionCounts { heart: 5, thunder: 2 });
    }

    #[tokio::test]
    async fn switching_reaction_rolls_back_on_failure() {
        let api = api_with_groups();
        let reconciler = loaded(&api, &memory_cache()).await;
        reconciler.react(30, Reaction::Thunder).await.unwrap();

        api.fail_commands(CommandError::rejected(500, "boom"));
        assert!(reconciler.react(30, Reaction::Heart).await.is_err());
        assert!(reconciler.remove_reaction(30).await.is_err());

        let story = reconciler.friend_stories()[1].stories[0].clone();
        assert_eq!(story.user_reaction, Some(Reaction::Thunder));
        assert_eq!(story.reactions, ReactionCounts { heart: 5, thunder: 2 });
    }

    #[tokio::test]
    async fn remove_reaction_clears_user_reaction() {
        let api = api_with_groups();
        let reconciler = loaded(&api, &memory_cache()).await;
        reconciler.react(30, Reaction::Heart).await.unwrap();
        let counts = reconciler.remove_reaction(30).await.unwrap();
        assert_eq!(counts.heart, 4);
        assert_eq!(reconciler.friend_stories()[1].stories[0].user_reaction, None);
    }

    #[tokio::test]
    async fn create_prepends_to_my_group() {
        let api = api_with_groups();
        let reconciler = loaded(&api, &memory_cache()).await;
        let draft = StoryDraft {
            media_url: "https://cdn.test/new.jpg".into(),
            media_type: MediaType::Image,
            caption: Some("hello".into()),
        };
        let created = reconciler.create_story(&draft).await.unwrap();
        let mine = reconciler.my_stories().unwrap();
        assert_eq!(mine.stories[0].id, created.id);
        assert_eq!(mine.stories.len(), 2);
    }

    #[tokio::test]
    async fn delete_drops_story_group_and_view() {
        let api = api_with_groups();
        let cache = memory_cache();
        let reconciler = loaded(&api, &cache).await;
        reconciler.mark_viewed(1).await;

        reconciler.delete_story(1).await.unwrap();
        assert!(reconciler.my_stories().is_none());
        assert!(!reconciler.is_viewed(1));
        assert!(StoryReconciler::new(ME, api.clone(), cache).viewed_story_ids().is_empty());
    }

    #[tokio::test]
    async fn unknown_story_reaction_is_invalid() {
        let api = api_with_groups();
        let reconciler = loaded(&api, &memory_cache()).await;
        assert!(matches!(
            reconciler.react(999, Reaction::Heart).await,
            Err(CommandError::Invalid(_))
        ));
    }
}
