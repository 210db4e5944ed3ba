//! Feed composition: one page per call, plus a stateful session that
//! accumulates pages and discards responses overtaken by a mode or filter
//! change.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{AuthorInfo, FeedItem, Id, Post, Timestamp};
use crate::profile::{ProfileCache, ProfileService, DEFAULT_PROFILE_CAPACITY, DEFAULT_PROFILE_TTL};
use crate::repo::{PostOrder, PostQuery, Repo, RepoError};
use crate::store::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum FeedMode {
    #[default]
    ForYou,
    Following,
    Trending,
}

impl FeedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedMode::ForYou => "forYou",
            FeedMode::Following => "following",
            FeedMode::Trending => "trending",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedFilters {
    /// Only honoured in `forYou`.
    pub categories: BTreeSet<String>,
    pub search: Option<String>,
}

impl FeedFilters {
    pub fn categories(categories: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { categories: categories.into_iter().map(Into::into).collect(), search: None }
    }

    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }
}

/// Sort position of the last fetched post, bound to the mode that produced
/// it. Travels to clients as URL-safe base64 JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedCursor {
    pub mode: FeedMode,
    pub position: Cursor,
}

impl FeedCursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(token: &str) -> ServiceResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| ServiceError::Validation("malformed cursor".into()))?;
        serde_json::from_slice(&bytes).map_err(|_| ServiceError::Validation("malformed cursor".into()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    /// `None` once `has_more` is false.
    pub next_cursor: Option<FeedCursor>,
    /// True when the store returned a full batch. Client-side filtering can
    /// leave a page short while this is still true.
    pub has_more: bool,
}

impl FeedPage {
    pub fn empty() -> Self { Self::default() }
}

/// Client-side stage applied to fetched posts, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostFilter {
    /// Keep posts sharing at least one category with the set.
    Categories(BTreeSet<String>),
    /// Keep posts whose description contains the lowercased term.
    Search(String),
}

impl PostFilter {
    pub fn keep(&self, post: &Post) -> bool {
        match self {
            PostFilter::Categories(wanted) => post.in_any_category(wanted),
            PostFilter::Search(term) => post.description.to_lowercase().contains(term),
        }
    }
}

/// Store query plus post-filter stages for one page request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub query: PostQuery,
    pub post_filters: Vec<PostFilter>,
}

impl QueryPlan {
    /// `None` when the page is known to be empty without asking the store.
    pub fn build(
        mode: FeedMode,
        filters: &FeedFilters,
        following: &[Id],
        start_after: Option<Cursor>,
        page_size: usize,
        overfetch_factor: usize,
    ) -> Option<Self> {
        let mut post_filters = Vec::new();
        let (authors, order, limit) = match mode {
            FeedMode::Following => {
                if following.is_empty() {
                    return None;
                }
                (Some(following.to_vec()), PostOrder::Newest, page_size)
            }
            FeedMode::Trending => (None, PostOrder::MostLiked, page_size),
            FeedMode::ForYou if filters.categories.is_empty() => (None, PostOrder::Newest, page_size),
            FeedMode::ForYou => {
                post_filters.push(PostFilter::Categories(filters.categories.clone()));
                (None, PostOrder::Newest, page_size.saturating_mul(overfetch_factor.max(1)))
            }
        };
        if let Some(term) = filters.search_term() {
            post_filters.push(PostFilter::Search(term));
        }
        Some(Self { query: PostQuery { authors, order, limit, start_after }, post_filters })
    }

    pub fn keep(&self, post: &Post) -> bool {
        self.post_filters.iter().all(|f| f.keep(post))
    }
}

#[derive(Debug, Clone)]
pub struct ComposerConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Candidates fetched per requested item when category filters apply.
    pub overfetch_factor: usize,
    pub profile_cache_ttl: Duration,
    pub profile_cache_capacity: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: 50,
            overfetch_factor: 3,
            profile_cache_ttl: DEFAULT_PROFILE_TTL,
            profile_cache_capacity: DEFAULT_PROFILE_CAPACITY,
        }
    }
}

/// Stateless page builder. The result depends only on the arguments and
/// the store contents.
#[derive(Clone)]
pub struct FeedComposer {
    repo: Arc<dyn Repo>,
    profiles: ProfileService,
    config: ComposerConfig,
}

impl FeedComposer {
    pub fn new(repo: Arc<dyn Repo>, profiles: ProfileService, config: ComposerConfig) -> Self {
        Self { repo, profiles, config }
    }

    pub fn config(&self) -> &ComposerConfig { &self.config }

    pub fn profiles(&self) -> &ProfileService { &self.profiles }

    /// Same composer reading profiles through a cache of its own.
    pub fn with_private_profile_cache(&self) -> Self {
        let cache = ProfileCache::with_limits(self.config.profile_cache_ttl, self.config.profile_cache_capacity);
        Self {
            repo: self.repo.clone(),
            profiles: ProfileService::new(self.repo.clone(), cache),
            config: self.config.clone(),
        }
    }

    fn page_size(&self, requested: Option<usize>) -> ServiceResult<usize> {
        match requested {
            None => Ok(self.config.default_page_size),
            Some(0) => Err(ServiceError::Validation("page size must be positive".into())),
            Some(n) => Ok(n.min(self.config.max_page_size)),
        }
    }

    /// Category filters derived from the viewer's declared interests.
    pub async fn interest_filters(&self, viewer: &str) -> ServiceResult<BTreeSet<String>> {
        self.profiles.category_filters(viewer).await
    }

    pub async fn fetch_page(
        &self,
        viewer: &str,
        mode: FeedMode,
        filters: &FeedFilters,
        cursor: Option<&FeedCursor>,
        page_size: Option<usize>,
    ) -> ServiceResult<FeedPage> {
        let page_size = self.page_size(page_size)?;
        let start_after = match cursor {
            Some(c) if c.mode != mode => {
                return Err(ServiceError::Validation(format!(
                    "cursor belongs to the {} feed, not {}",
                    c.mode.as_str(),
                    mode.as_str()
                )));
            }
            Some(c) => Some(c.position.clone()),
            None => None,
        };
        let following = match mode {
            FeedMode::Following => self.profiles.following_ids(viewer).await?,
            _ => Vec::new(),
        };
        let Some(plan) = QueryPlan::build(mode, filters, &following, start_after, page_size, self.config.overfetch_factor)
        else {
            return Ok(FeedPage::empty());
        };

        let fetched = self.repo.query_posts(&plan.query).await?;
        let has_more = fetched.posts.len() >= plan.query.limit;
        let next_cursor = match (has_more, fetched.last_cursor) {
            (true, Some(position)) => Some(FeedCursor { mode, position }),
            _ => None,
        };
        let kept: Vec<Post> = fetched.posts.into_iter().filter(|p| plan.keep(p)).collect();
        let items = self.join_authors(kept).await?;

        metrics::counter!("craftfeed_feed_pages_total", "mode" => mode.as_str()).increment(1);
        Ok(FeedPage { items, next_cursor, has_more })
    }

    /// A single post with its author joined, as it appears in a feed.
    pub async fn item(&self, post_id: &str) -> ServiceResult<FeedItem> {
        let post = self.repo.get_post(post_id).await?;
        let mut items = self.join_authors(vec![post]).await?;
        items.pop().ok_or(ServiceError::NotFound)
    }

    async fn join_authors(&self, posts: Vec<Post>) -> ServiceResult<Vec<FeedItem>> {
        let mut authors: HashMap<Id, AuthorInfo> = HashMap::new();
        let mut items = Vec::with_capacity(posts.len());
        for post in posts {
            let author = match authors.get(&post.author_id) {
                Some(a) => a.clone(),
                None => {
                    let info = match self.repo.author_info(&post.author_id).await {
                        Ok(info) => info,
                        Err(RepoError::NotFound) => {
                            debug!(author_id = %post.author_id, post_id = %post.id, "author missing, using placeholder");
                            AuthorInfo::placeholder()
                        }
                        Err(e) => return Err(e.into()),
                    };
                    authors.insert(post.author_id.clone(), info.clone());
                    info
                }
            };
            items.push(FeedItem { post, author });
        }
        Ok(items)
    }
}

struct SessionState {
    mode: FeedMode,
    filters: FeedFilters,
    cursor: Option<FeedCursor>,
    items: Vec<FeedItem>,
    seen: HashSet<Id>,
    has_more: bool,
    /// Bumped on every reset; a response is applied only if it still matches.
    generation: u64,
}

impl SessionState {
    fn reset(&mut self) {
        self.cursor = None;
        self.items.clear();
        self.seen.clear();
        self.has_more = true;
        self.generation += 1;
    }
}

/// One viewer's scroll position through a feed.
pub struct FeedSession {
    composer: FeedComposer,
    viewer: Id,
    page_size: Option<usize>,
    state: Mutex<SessionState>,
}

impl FeedSession {
    /// The session reads profiles through its own cache, emptied whenever it
    /// loads a first page.
    pub fn new(composer: FeedComposer, viewer: impl Into<Id>, mode: FeedMode, filters: FeedFilters) -> Self {
        Self {
            composer: composer.with_private_profile_cache(),
            viewer: viewer.into(),
            page_size: None,
            state: Mutex::new(SessionState {
                mode,
                filters,
                cursor: None,
                items: Vec::new(),
                seen: HashSet::new(),
                has_more: true,
                generation: 0,
            }),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn viewer(&self) -> &str { &self.viewer }
    pub fn mode(&self) -> FeedMode { self.state().mode }
    pub fn filters(&self) -> FeedFilters { self.state().filters.clone() }
    pub fn has_more(&self) -> bool { self.state().has_more }
    pub fn generation(&self) -> u64 { self.state().generation }
    pub fn items(&self) -> Vec<FeedItem> { self.state().items.clone() }
    pub fn len(&self) -> usize { self.state().items.len() }
    pub fn is_empty(&self) -> bool { self.state().items.is_empty() }

    pub fn composer(&self) -> &FeedComposer { &self.composer }

    /// Id of the first post currently shown.
    pub fn head_post_id(&self) -> Option<Id> {
        self.state().items.first().map(|i| i.post.id.clone())
    }

    /// Creation time of the most recent post shown, whatever its position.
    pub fn newest_created_at(&self) -> Option<Timestamp> {
        self.state().items.iter().map(|i| i.post.created_at).max()
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.state().seen.contains(post_id)
    }

    /// Switching modes starts over from the top.
    pub fn set_mode(&self, mode: FeedMode) {
        let mut s = self.state();
        if s.mode != mode {
            s.mode = mode;
            s.reset();
        }
    }

    pub fn set_filters(&self, filters: FeedFilters) {
        let mut s = self.state();
        if s.filters != filters {
            s.filters = filters;
            s.reset();
        }
    }

    pub fn reset_cursor(&self) {
        self.state().reset();
    }

    /// Load the next page and append its unseen items.
    ///
    /// Returns `Ok(None)` when the mode, filters or cursor changed while the
    /// request was in flight; the response is dropped. On error the items
    /// loaded so far are kept.
    pub async fn fetch_next_page(&self) -> ServiceResult<Option<FeedPage>> {
        let (generation, mode, filters, cursor) = {
            let s = self.state();
            if !s.has_more {
                return Ok(Some(FeedPage::empty()));
            }
            (s.generation, s.mode, s.filters.clone(), s.cursor.clone())
        };
        if cursor.is_none() {
            self.composer.profiles().cache().clear();
        }

        let result = self
            .composer
            .fetch_page(&self.viewer, mode, &filters, cursor.as_ref(), self.page_size)
            .await;

        let mut s = self.state();
        if s.generation != generation {
            debug!(viewer = %self.viewer, mode = mode.as_str(), "discarding stale feed response");
            metrics::counter!("craftfeed_stale_pages_total").increment(1);
            return Ok(None);
        }
        let mut page = result?;
        page.items.retain(|item| s.seen.insert(item.post.id.clone()));
        s.items.extend(page.items.iter().cloned());
        s.cursor = page.next_cursor.clone();
        s.has_more = page.has_more;
        Ok(Some(page))
    }

    /// Drop everything and load the first page again.
    pub async fn refresh(&self) -> ServiceResult<Option<FeedPage>> {
        self.reset_cursor();
        self.fetch_next_page().await
    }
}
