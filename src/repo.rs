use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::models::*;
use crate::schema::{encode_interest, fields, millis, DecodeError, Entity};
use crate::store::{Cursor, DocumentStore, Filter, OrderBy, Query, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("malformed document: {0}")] Decode(#[from] DecodeError),
    #[error("store: {0}")] Store(StoreError),
}

impl From<StoreError> for RepoError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => RepoError::NotFound,
            StoreError::AlreadyExists => RepoError::Conflict,
            other => RepoError::Store(other),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Where comments live: inside the post document or in their own collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommentLayout {
    #[default]
    Collection,
    Embedded,
}

/// Sort order for post listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOrder {
    /// `createdAt desc`
    Newest,
    /// `likeCount desc, createdAt desc`
    MostLiked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostQuery {
    /// Restrict to these authors; `None` means everyone.
    pub authors: Option<Vec<Id>>,
    pub order: PostOrder,
    pub limit: usize,
    pub start_after: Option<Cursor>,
}

#[derive(Debug, Clone, Default)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub last_cursor: Option<Cursor>,
}

#[async_trait]
pub trait ProfileRepo: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> RepoResult<UserProfile>;
    /// Return the profile, creating it on first sign-in.
    async fn ensure_profile(&self, user_id: &str, new: NewProfile) -> RepoResult<UserProfile>;
    async fn author_info(&self, user_id: &str) -> RepoResult<AuthorInfo>;
    async fn add_following(&self, user_id: &str, target_id: &str) -> RepoResult<()>;
    async fn remove_following(&self, user_id: &str, target_id: &str) -> RepoResult<()>;
    async fn set_interests(&self, user_id: &str, interests: Vec<Interest>) -> RepoResult<()>;
    async fn add_post_ref(&self, user_id: &str, post_id: &str) -> RepoResult<()>;
    async fn remove_post_ref(&self, user_id: &str, post_id: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn get_post(&self, id: &str) -> RepoResult<Post>;
    async fn create_post(&self, author_id: &str, new: NewPost) -> RepoResult<Post>;
    async fn update_post(&self, id: &str, upd: PostUpdate) -> RepoResult<Post>;
    async fn delete_post(&self, id: &str) -> RepoResult<()>;
    async fn query_posts(&self, q: &PostQuery) -> RepoResult<PostPage>;
    /// Every post by one author, unpaged.
    async fn posts_by_author(&self, author_id: &str) -> RepoResult<Vec<Post>>;
    /// Atomic adjustment; returns the new count.
    async fn adjust_like_count(&self, id: &str, delta: i64) -> RepoResult<i64>;
}

#[async_trait]
pub trait ReactionRepo: Send + Sync {
    async fn find_reaction(&self, kind: ReactionKind, post_id: &str, user_id: &str) -> RepoResult<Option<Reaction>>;
    /// `Conflict` if the pair already has one.
    async fn create_reaction(&self, kind: ReactionKind, post_id: &str, user_id: &str) -> RepoResult<Reaction>;
    /// True when this call removed the reaction; concurrent removals of the
    /// same pair see exactly one `true`.
    async fn delete_reaction(&self, kind: ReactionKind, post_id: &str, user_id: &str) -> RepoResult<bool>;
    async fn reactions_for_post(&self, kind: ReactionKind, post_id: &str) -> RepoResult<Vec<Reaction>>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn add_comment(&self, post_id: &str, new: NewComment) -> RepoResult<Comment>;
    async fn get_comment(&self, comment_id: &str) -> RepoResult<Comment>;
    /// Oldest first.
    async fn list_comments(&self, post_id: &str) -> RepoResult<Vec<Comment>>;
    async fn delete_comment(&self, comment_id: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait DraftRepo: Send + Sync {
    async fn create_draft(&self, author_id: &str, new: NewPost) -> RepoResult<Draft>;
    async fn get_draft(&self, id: &str) -> RepoResult<Draft>;
    async fn update_draft(&self, id: &str, upd: PostUpdate) -> RepoResult<Draft>;
    async fn delete_draft(&self, id: &str) -> RepoResult<()>;
    async fn list_drafts(&self, author_id: &str) -> RepoResult<Vec<Draft>>;
}

pub trait Repo: ProfileRepo + PostRepo + ReactionRepo + CommentRepo + DraftRepo {}

impl<T> Repo for T where T: ProfileRepo + PostRepo + ReactionRepo + CommentRepo + DraftRepo {}

/// Repository over any [`DocumentStore`].
#[derive(Clone)]
pub struct DocRepo {
    store: Arc<dyn DocumentStore>,
    comments: CommentLayout,
}

const EMBEDDED_ID_SEP: char = '~';

impl DocRepo {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store, comments: CommentLayout::default() }
    }

    pub fn with_comment_layout(mut self, layout: CommentLayout) -> Self {
        self.comments = layout;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> { &self.store }

    async fn load<E: Entity>(&self, id: &str) -> RepoResult<E> {
        let doc = self.store.get(E::COLLECTION, id).await?;
        Ok(E::decode(id, &doc)?)
    }

    /// Merge the edited fields and bump `updatedAt`; images and the carousel
    /// flag are always written together.
    fn update_fields(upd: &PostUpdate) -> crate::store::Document {
        let mut doc = crate::store::Document::new();
        if let Some(description) = &upd.description {
            doc.insert("description".into(), json!(description));
        }
        if let Some(images) = &upd.images {
            let list = ImageList::new(images.clone());
            doc.insert("images".into(), json!(list.as_slice()));
            doc.insert("hasCarousel".into(), json!(list.has_carousel()));
        }
        if let Some(categories) = &upd.categories {
            doc.insert("categories".into(), json!(categories));
        }
        if let Some(craft_type) = &upd.craft_type {
            doc.insert("craftType".into(), json!(craft_type));
        }
        doc.insert(fields::UPDATED_AT.into(), millis(Utc::now()));
        doc
    }

    fn split_embedded_id(comment_id: &str) -> RepoResult<&str> {
        comment_id
            .split_once(EMBEDDED_ID_SEP)
            .map(|(post_id, _)| post_id)
            .ok_or(RepoError::NotFound)
    }
}

fn craft_type_or_default(craft_type: Option<String>) -> String {
    craft_type.filter(|c| !c.trim().is_empty()).unwrap_or_else(|| DEFAULT_CRAFT_TYPE.to_string())
}

#[async_trait]
impl ProfileRepo for DocRepo {
    async fn get_profile(&self, user_id: &str) -> RepoResult<UserProfile> {
        self.load(user_id).await
    }

    async fn ensure_profile(&self, user_id: &str, new: NewProfile) -> RepoResult<UserProfile> {
        match self.load::<UserProfile>(user_id).await {
            Err(RepoError::NotFound) => {}
            other => return other,
        }
        let profile = UserProfile {
            id: user_id.to_string(),
            username: new.username,
            email: new.email,
            display_name: new.display_name,
            avatar_url: new.avatar_url,
            following: Vec::new(),
            posts: Vec::new(),
            interests: Vec::new(),
            created_at: Utc::now(),
        };
        match self.store.create(UserProfile::COLLECTION, user_id, profile.encode()).await {
            Ok(()) => Ok(profile),
            // concurrent first sign-in: the other writer won
            Err(StoreError::AlreadyExists) => self.load(user_id).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn author_info(&self, user_id: &str) -> RepoResult<AuthorInfo> {
        Ok(self.get_profile(user_id).await?.author_info())
    }

    async fn add_following(&self, user_id: &str, target_id: &str) -> RepoResult<()> {
        self.store
            .array_union(UserProfile::COLLECTION, user_id, fields::FOLLOWING, vec![json!(target_id)])
            .await?;
        Ok(())
    }

    async fn remove_following(&self, user_id: &str, target_id: &str) -> RepoResult<()> {
        self.store
            .array_remove(UserProfile::COLLECTION, user_id, fields::FOLLOWING, vec![json!(target_id)])
            .await?;
        Ok(())
    }

    async fn set_interests(&self, user_id: &str, interests: Vec<Interest>) -> RepoResult<()> {
        let encoded: Vec<Value> = interests.iter().map(encode_interest).collect();
        let mut doc = crate::store::Document::new();
        doc.insert(fields::INTERESTS.into(), Value::Array(encoded));
        self.store.update(UserProfile::COLLECTION, user_id, doc).await?;
        Ok(())
    }

    async fn add_post_ref(&self, user_id: &str, post_id: &str) -> RepoResult<()> {
        self.store
            .array_union(UserProfile::COLLECTION, user_id, fields::POSTS, vec![json!(post_id)])
            .await?;
        Ok(())
    }

    async fn remove_post_ref(&self, user_id: &str, post_id: &str) -> RepoResult<()> {
        self.store
            .array_remove(UserProfile::COLLECTION, user_id, fields::POSTS, vec![json!(post_id)])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PostRepo for DocRepo {
    async fn get_post(&self, id: &str) -> RepoResult<Post> {
        self.load(id).await
    }

    async fn create_post(&self, author_id: &str, new: NewPost) -> RepoResult<Post> {
        let now = Utc::now();
        let mut post = Post::new(
            String::new(),
            author_id.to_string(),
            new.description,
            new.images,
            0,
            new.categories,
            craft_type_or_default(new.craft_type),
            now,
            now,
        );
        post.id = self.store.add(Post::COLLECTION, post.encode()).await?;
        Ok(post)
    }

    async fn update_post(&self, id: &str, upd: PostUpdate) -> RepoResult<Post> {
        self.store.update(Post::COLLECTION, id, Self::update_fields(&upd)).await?;
        self.get_post(id).await
    }

    async fn delete_post(&self, id: &str) -> RepoResult<()> {
        self.store.delete(Post::COLLECTION, id).await?;
        Ok(())
    }

    async fn query_posts(&self, q: &PostQuery) -> RepoResult<PostPage> {
        let mut query = Query::new().limit(q.limit).start_after(q.start_after.clone());
        if let Some(authors) = &q.authors {
            query = query.filter(Filter::is_in(fields::AUTHOR_ID, authors.iter().map(String::as_str)));
        }
        query = match q.order {
            PostOrder::Newest => query.order(OrderBy::desc(fields::CREATED_AT)),
            PostOrder::MostLiked => query
                .order(OrderBy::desc(fields::LIKE_COUNT))
                .order(OrderBy::desc(fields::CREATED_AT)),
        };
        let page = self.store.query(Post::COLLECTION, &query).await?;
        let posts = page
            .items
            .iter()
            .map(|d| Post::decode(&d.id, &d.data))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PostPage { posts, last_cursor: page.last_cursor })
    }

    async fn posts_by_author(&self, author_id: &str) -> RepoResult<Vec<Post>> {
        let query = Query::new().filter(Filter::eq(fields::AUTHOR_ID, author_id));
        let page = self.store.query(Post::COLLECTION, &query).await?;
        Ok(page
            .items
            .iter()
            .map(|d| Post::decode(&d.id, &d.data))
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn adjust_like_count(&self, id: &str, delta: i64) -> RepoResult<i64> {
        Ok(self.store.increment(Post::COLLECTION, id, fields::LIKE_COUNT, delta).await?)
    }
}

#[async_trait]
impl ReactionRepo for DocRepo {
    async fn find_reaction(&self, kind: ReactionKind, post_id: &str, user_id: &str) -> RepoResult<Option<Reaction>> {
        let key = ReactionKind::key(post_id, user_id);
        match self.store.get(kind.collection(), &key).await {
            Ok(doc) => Ok(Some(Reaction::decode(&key, &doc)?)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_reaction(&self, kind: ReactionKind, post_id: &str, user_id: &str) -> RepoResult<Reaction> {
        let reaction = Reaction {
            id: ReactionKind::key(post_id, user_id),
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        };
        self.store.create(kind.collection(), &reaction.id, reaction.encode()).await?;
        Ok(reaction)
    }

    async fn delete_reaction(&self, kind: ReactionKind, post_id: &str, user_id: &str) -> RepoResult<bool> {
        Ok(self.store.delete(kind.collection(), &ReactionKind::key(post_id, user_id)).await?)
    }

    async fn reactions_for_post(&self, kind: ReactionKind, post_id: &str) -> RepoResult<Vec<Reaction>> {
        let query = Query::new().filter(Filter::eq(fields::POST_ID, post_id));
        let page = self.store.query(kind.collection(), &query).await?;
        Ok(page
            .items
            .iter()
            .map(|d| Reaction::decode(&d.id, &d.data))
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl CommentRepo for DocRepo {
    async fn add_comment(&self, post_id: &str, new: NewComment) -> RepoResult<Comment> {
        let mut comment = Comment {
            id: String::new(),
            post_id: post_id.to_string(),
            user_id: new.user_id,
            username: new.username,
            user_image: new.user_image,
            content: new.content,
            created_at: Utc::now(),
            likes: 0,
            replies: Vec::new(),
        };
        match self.comments {
            CommentLayout::Collection => {
                comment.id = self.store.add(Comment::COLLECTION, comment.encode()).await?;
            }
            CommentLayout::Embedded => {
                comment.id = format!("{post_id}{EMBEDDED_ID_SEP}{}", uuid::Uuid::new_v4().simple());
                self.store
                    .array_union(Post::COLLECTION, post_id, fields::COMMENTS, vec![comment.encode_embedded()])
                    .await?;
            }
        }
        Ok(comment)
    }

    async fn get_comment(&self, comment_id: &str) -> RepoResult<Comment> {
        match self.comments {
            CommentLayout::Collection => self.load(comment_id).await,
            CommentLayout::Embedded => {
                let post_id = Self::split_embedded_id(comment_id)?;
                self.list_comments(post_id)
                    .await?
                    .into_iter()
                    .find(|c| c.id == comment_id)
                    .ok_or(RepoError::NotFound)
            }
        }
    }

    async fn list_comments(&self, post_id: &str) -> RepoResult<Vec<Comment>> {
        let mut comments = match self.comments {
            CommentLayout::Collection => {
                let query = Query::new()
                    .filter(Filter::eq(fields::POST_ID, post_id))
                    .order(OrderBy::asc(fields::CREATED_AT));
                let page = self.store.query(Comment::COLLECTION, &query).await?;
                page.items
                    .iter()
                    .map(|d| Comment::decode(&d.id, &d.data))
                    .collect::<Result<Vec<_>, _>>()?
            }
            CommentLayout::Embedded => {
                let doc = self.store.get(Post::COLLECTION, post_id).await?;
                match doc.get(fields::COMMENTS) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(Comment::decode_embedded)
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => Vec::new(),
                }
            }
        };
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }

    async fn delete_comment(&self, comment_id: &str) -> RepoResult<()> {
        match self.comments {
            CommentLayout::Collection => {
                self.store.delete(Comment::COLLECTION, comment_id).await?;
            }
            CommentLayout::Embedded => {
                let post_id = Self::split_embedded_id(comment_id)?;
                let doc = self.store.get(Post::COLLECTION, post_id).await?;
                let stored: Vec<Value> = match doc.get(fields::COMMENTS) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter(|v| v.get("id").and_then(Value::as_str) == Some(comment_id))
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                if !stored.is_empty() {
                    self.store.array_remove(Post::COLLECTION, post_id, fields::COMMENTS, stored).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DraftRepo for DocRepo {
    async fn create_draft(&self, author_id: &str, new: NewPost) -> RepoResult<Draft> {
        let now = Utc::now();
        let mut draft = Draft::new(
            String::new(),
            author_id.to_string(),
            new.description,
            new.images,
            new.categories,
            craft_type_or_default(new.craft_type),
            now,
            now,
        );
        draft.id = self.store.add(Draft::COLLECTION, draft.encode()).await?;
        Ok(draft)
    }

    async fn get_draft(&self, id: &str) -> RepoResult<Draft> {
        self.load(id).await
    }

    async fn update_draft(&self, id: &str, upd: PostUpdate) -> RepoResult<Draft> {
        self.store.update(Draft::COLLECTION, id, Self::update_fields(&upd)).await?;
        self.get_draft(id).await
    }

    async fn delete_draft(&self, id: &str) -> RepoResult<()> {
        self.store.delete(Draft::COLLECTION, id).await?;
        Ok(())
    }

    async fn list_drafts(&self, author_id: &str) -> RepoResult<Vec<Draft>> {
        let query = Query::new()
            .filter(Filter::eq(fields::AUTHOR_ID, author_id))
            .order(OrderBy::desc(fields::UPDATED_AT));
        let page = self.store.query(Draft::COLLECTION, &query).await?;
        Ok(page
            .items
            .iter()
            .map(|d| Draft::decode(&d.id, &d.data))
            .collect::<Result<Vec<_>, _>>()?)
    }
}

/// Normalise a category set: trimmed, empty entries dropped.
pub fn clean_categories(categories: BTreeSet<String>) -> BTreeSet<String> {
    categories
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Write a fully specified post, timestamps included. Used by importers and
/// by tests that need a fixed timeline.
pub async fn insert_post_raw(store: &dyn DocumentStore, post: &Post) -> RepoResult<()> {
    store.put(Post::COLLECTION, &post.id, post.encode()).await?;
    Ok(())
}
