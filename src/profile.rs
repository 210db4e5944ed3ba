use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{Id, Interest, NewProfile, UserProfile};
use crate::repo::Repo;

pub const DEFAULT_PROFILE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROFILE_CAPACITY: usize = 10_000;

struct Cached {
    profile: Arc<UserProfile>,
    loaded: Instant,
}

/// Profiles read recently, so paging through a feed does not reload the
/// viewer's graph and interests on every page.
///
/// Entries expire after `ttl`, which bounds staleness for writes made by other
/// processes. Writes through this process invalidate the writer's entry. At
/// `capacity` the oldest entry makes room.
#[derive(Clone)]
pub struct ProfileCache {
    entries: Arc<DashMap<Id, Cached>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::with_limits(DEFAULT_PROFILE_TTL, DEFAULT_PROFILE_CAPACITY)
    }
}

impl ProfileCache {
    pub fn new() -> Self { Self::default() }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self { entries: Arc::new(DashMap::new()), ttl, capacity }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub async fn get(&self, repo: &dyn Repo, user_id: &str) -> ServiceResult<Arc<UserProfile>> {
        if let Some(hit) = self.entries.get(user_id) {
            if hit.loaded.elapsed() < self.ttl {
                return Ok(hit.profile.clone());
            }
        }
        let profile = Arc::new(repo.get_profile(user_id).await?);
        self.insert(user_id, profile.clone());
        Ok(profile)
    }

    fn insert(&self, user_id: &str, profile: Arc<UserProfile>) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(user_id) {
            self.entries.retain(|_, e| e.loaded.elapsed() < self.ttl);
            if self.entries.len() >= self.capacity {
                let oldest = self.entries.iter().min_by_key(|e| e.loaded).map(|e| e.key().clone());
                if let Some(key) = oldest {
                    self.entries.remove(&key);
                }
            }
        }
        self.entries.insert(user_id.to_string(), Cached { profile, loaded: Instant::now() });
    }

    pub fn invalidate(&self, user_id: &str) {
        if self.entries.remove(user_id).is_some() {
            debug!(user_id, "profile cache entry dropped");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// UserProfileRepository operations with the session cache kept coherent.
#[derive(Clone)]
pub struct ProfileService {
    repo: Arc<dyn Repo>,
    cache: ProfileCache,
}

impl ProfileService {
    pub fn new(repo: Arc<dyn Repo>, cache: ProfileCache) -> Self {
        Self { repo, cache }
    }

    pub fn cache(&self) -> &ProfileCache { &self.cache }

    pub async fn sign_in(&self, user_id: &str, new: NewProfile) -> ServiceResult<UserProfile> {
        if new.username.trim().is_empty() {
            return Err(ServiceError::Validation("username must not be empty".into()));
        }
        let profile = self.repo.ensure_profile(user_id, new).await?;
        self.cache.invalidate(user_id);
        Ok(profile)
    }

    pub async fn profile(&self, user_id: &str) -> ServiceResult<Arc<UserProfile>> {
        self.cache.get(self.repo.as_ref(), user_id).await
    }

    pub async fn following_ids(&self, user_id: &str) -> ServiceResult<Vec<Id>> {
        Ok(self.profile(user_id).await?.following.clone())
    }

    pub async fn category_filters(&self, user_id: &str) -> ServiceResult<BTreeSet<String>> {
        Ok(self.profile(user_id).await?.category_filters())
    }

    pub async fn follow(&self, user_id: &str, target_id: &str) -> ServiceResult<()> {
        if user_id == target_id {
            return Err(ServiceError::Validation("cannot follow yourself".into()));
        }
        // target must exist
        self.repo.get_profile(target_id).await?;
        self.repo.add_following(user_id, target_id).await?;
        self.cache.invalidate(user_id);
        Ok(())
    }

    pub async fn unfollow(&self, user_id: &str, target_id: &str) -> ServiceResult<()> {
        self.repo.remove_following(user_id, target_id).await?;
        self.cache.invalidate(user_id);
        Ok(())
    }

    pub async fn set_interests(&self, user_id: &str, interests: Vec<Interest>) -> ServiceResult<()> {
        let blank = interests.iter().any(|i| match i {
            Interest::Category(c) => c.trim().is_empty(),
            Interest::Sub { category, subcategory } => category.trim().is_empty() || subcategory.trim().is_empty(),
        });
        if blank {
            return Err(ServiceError::Validation("interests must not be blank".into()));
        }
        self.repo.set_interests(user_id, interests).await?;
        self.cache.invalidate(user_id);
        Ok(())
    }
}
