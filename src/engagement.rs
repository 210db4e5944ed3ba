//! Likes, saves, comments and post deletion.
//!
//! One Like/Save per (post, user) is enforced by the reaction key, and
//! `likeCount` only moves through the store's atomic increment. When the
//! counter write fails after the reaction write, the reaction write is undone.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{error, warn};

use crate::authoring::release_images;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{Comment, Id, NewComment, ReactionKind};
use crate::profile::ProfileCache;
use crate::repo::{Repo, RepoError};
use crate::storage::BlobStore;

/// Whether a toggle changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Applied,
    Unchanged,
}

#[derive(Clone)]
pub struct EngagementService {
    repo: Arc<dyn Repo>,
    blobs: Arc<dyn BlobStore>,
    profiles: ProfileCache,
}

fn record(action: &'static str) {
    metrics::counter!("craftfeed_engagement_total", "action" => action).increment(1);
}

impl EngagementService {
    pub fn new(repo: Arc<dyn Repo>, blobs: Arc<dyn BlobStore>, profiles: ProfileCache) -> Self {
        Self { repo, blobs, profiles }
    }

    pub async fn is_liked(&self, post_id: &str, user_id: &str) -> ServiceResult<bool> {
        Ok(self.repo.find_reaction(ReactionKind::Like, post_id, user_id).await?.is_some())
    }

    pub async fn is_saved(&self, post_id: &str, user_id: &str) -> ServiceResult<bool> {
        Ok(self.repo.find_reaction(ReactionKind::Save, post_id, user_id).await?.is_some())
    }

    pub async fn like(&self, post_id: &str, user_id: &str) -> ServiceResult<Toggle> {
        self.repo.get_post(post_id).await?;
        if self.repo.find_reaction(ReactionKind::Like, post_id, user_id).await?.is_some() {
            return Ok(Toggle::Unchanged);
        }
        self.repo.create_reaction(ReactionKind::Like, post_id, user_id).await?;
        if let Err(e) = self.repo.adjust_like_count(post_id, 1).await {
            warn!(post_id, user_id, "like count increment failed, removing like: {e}");
            if let Err(undo) = self.repo.delete_reaction(ReactionKind::Like, post_id, user_id).await {
                error!(post_id, user_id, "could not remove like after failed increment: {undo}");
            }
            return Err(e.into());
        }
        record("like");
        Ok(Toggle::Applied)
    }

    /// Only the call that actually removes the Like decrements the counter.
    pub async fn unlike(&self, post_id: &str, user_id: &str) -> ServiceResult<Toggle> {
        if !self.repo.delete_reaction(ReactionKind::Like, post_id, user_id).await? {
            return Ok(Toggle::Unchanged);
        }
        match self.repo.adjust_like_count(post_id, -1).await {
            Ok(count) if count < 0 => {
                warn!(post_id, count, "like count went negative, clamping to zero");
                self.repo.adjust_like_count(post_id, -count).await?;
            }
            Ok(_) => {}
            // post already gone; nothing left to count
            Err(RepoError::NotFound) => {}
            Err(e) => {
                warn!(post_id, user_id, "like count decrement failed, restoring like: {e}");
                if let Err(undo) = self.repo.create_reaction(ReactionKind::Like, post_id, user_id).await {
                    error!(post_id, user_id, "could not restore like after failed decrement: {undo}");
                }
                return Err(e.into());
            }
        }
        record("unlike");
        Ok(Toggle::Applied)
    }

    pub async fn save(&self, post_id: &str, user_id: &str) -> ServiceResult<Toggle> {
        self.repo.get_post(post_id).await?;
        match self.repo.create_reaction(ReactionKind::Save, post_id, user_id).await {
            Ok(_) => {
                record("save");
                Ok(Toggle::Applied)
            }
            Err(RepoError::Conflict) => Ok(Toggle::Unchanged),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn unsave(&self, post_id: &str, user_id: &str) -> ServiceResult<Toggle> {
        if !self.repo.delete_reaction(ReactionKind::Save, post_id, user_id).await? {
            return Ok(Toggle::Unchanged);
        }
        record("unsave");
        Ok(Toggle::Applied)
    }

    pub async fn add_comment(&self, post_id: &str, new: NewComment) -> ServiceResult<Id> {
        let content = new.content.trim();
        if content.is_empty() {
            return Err(ServiceError::Validation("comment must not be empty".into()));
        }
        let new = NewComment { content: content.to_string(), ..new };
        self.repo.get_post(post_id).await?;
        let comment = self.repo.add_comment(post_id, new).await?;
        record("comment");
        Ok(comment.id)
    }

    pub async fn comments(&self, post_id: &str) -> ServiceResult<Vec<Comment>> {
        Ok(self.repo.list_comments(post_id).await?)
    }

    /// The comment author or the post author may delete a comment.
    pub async fn delete_comment(&self, comment_id: &str, requester_id: &str) -> ServiceResult<()> {
        let comment = self.repo.get_comment(comment_id).await?;
        if comment.user_id != requester_id {
            let post_author = match self.repo.get_post(&comment.post_id).await {
                Ok(post) => Some(post.author_id),
                Err(RepoError::NotFound) => None,
                Err(e) => return Err(e.into()),
            };
            if post_author.as_deref() != Some(requester_id) {
                return Err(ServiceError::Unauthorized);
            }
        }
        self.repo.delete_comment(comment_id).await?;
        record("uncomment");
        Ok(())
    }

    /// Delete a post and everything hanging off it. Dependent records are
    /// removed first; any that could not be removed are reported in
    /// `PartialDeletion` after the post itself is gone.
    pub async fn delete_post(&self, post_id: &str, requester_id: &str) -> ServiceResult<()> {
        let post = self.repo.get_post(post_id).await?;
        if post.author_id != requester_id {
            return Err(ServiceError::Unauthorized);
        }

        let mut failures = Vec::new();
        for kind in [ReactionKind::Like, ReactionKind::Save] {
            match self.repo.reactions_for_post(kind, post_id).await {
                Ok(reactions) => {
                    let results = join_all(
                        reactions.iter().map(|r| self.repo.delete_reaction(kind, post_id, &r.user_id)),
                    )
                    .await;
                    for (r, res) in reactions.iter().zip(results) {
                        if let Err(e) = res {
                            failures.push(format!("{} {}: {e}", kind.collection(), r.id));
                        }
                    }
                }
                Err(e) => failures.push(format!("listing {}: {e}", kind.collection())),
            }
        }
        match self.repo.list_comments(post_id).await {
            Ok(comments) => {
                let results = join_all(comments.iter().map(|c| self.repo.delete_comment(&c.id))).await;
                for (c, res) in comments.iter().zip(results) {
                    if let Err(e) = res {
                        failures.push(format!("comment {}: {e}", c.id));
                    }
                }
            }
            Err(e) => failures.push(format!("listing comments: {e}")),
        }

        self.repo.delete_post(post_id).await?;

        if let Err(e) = self.repo.remove_post_ref(&post.author_id, post_id).await {
            failures.push(format!("author post list: {e}"));
        }
        self.profiles.invalidate(&post.author_id);
        failures.extend(
            release_images(self.repo.as_ref(), self.blobs.as_ref(), &post.author_id, post.images().as_slice()).await,
        );

        record("delete_post");
        if failures.is_empty() {
            Ok(())
        } else {
            error!(post_id, failed = failures.len(), "post deleted with leftovers: {failures:?}");
            Err(ServiceError::PartialDeletion { post_id: post_id.to_string(), failures })
        }
    }
}
