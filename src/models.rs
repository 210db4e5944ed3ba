use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = String;
pub type Timestamp = DateTime<Utc>;

pub const DEFAULT_CRAFT_TYPE: &str = "General";

/// Image URLs of a post or draft; the first one is the cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageList(Vec<String>);

impl ImageList {
    pub fn new(urls: Vec<String>) -> Self { Self(urls) }
    pub fn as_slice(&self) -> &[String] { &self.0 }
    pub fn cover(&self) -> Option<&str> { self.0.first().map(String::as_str) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn has_carousel(&self) -> bool { self.0.len() > 1 }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: Id,
    pub author_id: Id,
    pub description: String,
    #[schema(value_type = Vec<String>)]
    images: ImageList,
    has_carousel: bool,
    pub like_count: i64,
    #[schema(value_type = Vec<String>)]
    pub categories: BTreeSet<String>,
    pub craft_type: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Post {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        author_id: Id,
        description: String,
        images: Vec<String>,
        like_count: i64,
        categories: BTreeSet<String>,
        craft_type: String,
        created_at: Timestamp,
        updated_at: Timestamp,
    ) -> Self {
        let images = ImageList::new(images);
        Self {
            id,
            author_id,
            description,
            has_carousel: images.has_carousel(),
            images,
            like_count,
            categories,
            craft_type,
            created_at,
            updated_at,
        }
    }

    pub fn images(&self) -> &ImageList { &self.images }

    pub fn has_carousel(&self) -> bool { self.has_carousel }

    /// Replace the image list; the carousel flag follows.
    pub fn set_images(&mut self, urls: Vec<String>) {
        self.images = ImageList::new(urls);
        self.has_carousel = self.images.has_carousel();
    }

    pub fn in_any_category(&self, wanted: &BTreeSet<String>) -> bool {
        self.categories.iter().any(|c| wanted.contains(c))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub description: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub categories: BTreeSet<String>,
    pub craft_type: Option<String>,
}

/// Partial edit of a post or draft; `None` leaves the field alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostUpdate {
    pub description: Option<String>,
    pub images: Option<Vec<String>>,
    #[schema(value_type = Option<Vec<String>>)]
    pub categories: Option<BTreeSet<String>>,
    pub craft_type: Option<String>,
}

impl PostUpdate {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.images.is_none() && self.categories.is_none() && self.craft_type.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: Id,
    pub author_id: Id,
    pub description: String,
    #[schema(value_type = Vec<String>)]
    images: ImageList,
    has_carousel: bool,
    #[schema(value_type = Vec<String>)]
    pub categories: BTreeSet<String>,
    pub craft_type: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Draft {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        author_id: Id,
        description: String,
        images: Vec<String>,
        categories: BTreeSet<String>,
        craft_type: String,
        created_at: Timestamp,
        updated_at: Timestamp,
    ) -> Self {
        let images = ImageList::new(images);
        Self {
            id,
            author_id,
            description,
            has_carousel: images.has_carousel(),
            images,
            categories,
            craft_type,
            created_at,
            updated_at,
        }
    }

    pub fn images(&self) -> &ImageList { &self.images }

    pub fn has_carousel(&self) -> bool { self.has_carousel }

    pub fn set_images(&mut self, urls: Vec<String>) {
        self.images = ImageList::new(urls);
        self.has_carousel = self.images.has_carousel();
    }

    /// Content a published post starts from.
    pub fn to_new_post(&self) -> NewPost {
        NewPost {
            description: self.description.clone(),
            images: self.images.as_slice().to_vec(),
            categories: self.categories.clone(),
            craft_type: Some(self.craft_type.clone()),
        }
    }
}

/// A declared interest: a bare category or a category/subcategory pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum Interest {
    Category(String),
    Sub { category: String, subcategory: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Id,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    /// Followed user ids, oldest first.
    pub following: Vec<Id>,
    /// Own post ids, oldest first.
    pub posts: Vec<Id>,
    pub interests: Vec<Interest>,
    pub created_at: Timestamp,
}

impl UserProfile {
    /// Category names usable as feed filters; both halves of a
    /// category/subcategory pair count.
    pub fn category_filters(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for interest in &self.interests {
            match interest {
                Interest::Category(c) => {
                    out.insert(c.clone());
                }
                Interest::Sub { category, subcategory } => {
                    out.insert(category.clone());
                    out.insert(subcategory.clone());
                }
            }
        }
        out
    }

    pub fn author_info(&self) -> AuthorInfo {
        AuthorInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone().unwrap_or_else(|| self.username.clone()),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewProfile {
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Author fields joined onto a post when it is rendered in a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorInfo {
    pub id: Id,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

pub const PLACEHOLDER_AUTHOR_ID: &str = "unknown";

impl AuthorInfo {
    /// Stand-in for an author whose profile no longer exists.
    pub fn placeholder() -> Self {
        Self {
            id: PLACEHOLDER_AUTHOR_ID.to_string(),
            display_name: "Unknown crafter".to_string(),
            avatar_url: None,
        }
    }

    pub fn is_placeholder(&self) -> bool { self.id == PLACEHOLDER_AUTHOR_ID }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    #[serde(flatten)]
    pub post: Post,
    pub author: AuthorInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Save,
}

impl ReactionKind {
    pub fn collection(self) -> &'static str {
        match self {
            ReactionKind::Like => "likes",
            ReactionKind::Save => "saves",
        }
    }

    /// One reaction of a kind per (post, user): the pair is the key.
    pub fn key(post_id: &str, user_id: &str) -> String {
        format!("{post_id}:{user_id}")
    }
}

/// A Like or a Save.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: Id,
    pub post_id: Id,
    pub user_id: Id,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub user_id: Id,
    pub username: String,
    pub user_image: Option<String>,
    pub content: String,
    pub created_at: Timestamp,
    pub likes: i64,
    pub replies: Vec<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub user_id: Id,
    pub username: String,
    pub user_image: Option<String>,
    pub content: String,
}
