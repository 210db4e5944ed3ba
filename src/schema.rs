//! Typed boundary between entities and stored documents.
//!
//! Every entity has exactly one encoding. Decoding validates instead of
//! trusting the stored shape: timestamps are epoch milliseconds, counters
//! must be non-negative and `hasCarousel` is recomputed from `images`.

use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::models::*;
use crate::store::Document;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

pub trait Entity: Sized {
    const COLLECTION: &'static str;

    fn encode(&self) -> Document;
    fn decode(id: &str, doc: &Document) -> DecodeResult<Self>;
}

pub mod fields {
    pub const AUTHOR_ID: &str = "authorId";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const LIKE_COUNT: &str = "likeCount";
    pub const POST_ID: &str = "postId";
    pub const USER_ID: &str = "userId";
    pub const FOLLOWING: &str = "following";
    pub const POSTS: &str = "posts";
    pub const INTERESTS: &str = "interests";
    pub const COMMENTS: &str = "comments";
}

pub fn millis(ts: Timestamp) -> Value {
    Value::from(ts.timestamp_millis())
}

pub fn object(v: Value) -> Document {
    match v {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn str_field(doc: &Document, field: &'static str) -> DecodeResult<String> {
    match doc.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DecodeError::WrongType(field)),
        None => Err(DecodeError::Missing(field)),
    }
}

fn opt_str_field(doc: &Document, field: &'static str) -> DecodeResult<Option<String>> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DecodeError::WrongType(field)),
    }
}

fn count_field(doc: &Document, field: &'static str) -> DecodeResult<i64> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => {
            let n = v.as_i64().ok_or(DecodeError::WrongType(field))?;
            if n < 0 {
                return Err(DecodeError::Invalid { field, reason: format!("negative count {n}") });
            }
            Ok(n)
        }
    }
}

fn ts_field(doc: &Document, field: &'static str) -> DecodeResult<Timestamp> {
    let ms = doc
        .get(field)
        .ok_or(DecodeError::Missing(field))?
        .as_i64()
        .ok_or(DecodeError::WrongType(field))?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DecodeError::Invalid { field, reason: format!("timestamp {ms} out of range") })
}

fn string_list(doc: &Document, field: &'static str) -> DecodeResult<Vec<String>> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or(DecodeError::WrongType(field)))
            .collect(),
        Some(_) => Err(DecodeError::WrongType(field)),
    }
}

fn string_set(doc: &Document, field: &'static str) -> DecodeResult<BTreeSet<String>> {
    Ok(string_list(doc, field)?.into_iter().collect())
}

fn craft_type(doc: &Document) -> DecodeResult<String> {
    Ok(opt_str_field(doc, "craftType")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_CRAFT_TYPE.to_string()))
}

impl Entity for Post {
    const COLLECTION: &'static str = "posts";

    fn encode(&self) -> Document {
        object(json!({
            "authorId": self.author_id,
            "description": self.description,
            "images": self.images().as_slice(),
            "hasCarousel": self.images().has_carousel(),
            "likeCount": self.like_count,
            "categories": self.categories,
            "craftType": self.craft_type,
            "createdAt": millis(self.created_at),
            "updatedAt": millis(self.updated_at),
        }))
    }

    fn decode(id: &str, doc: &Document) -> DecodeResult<Self> {
        Ok(Post::new(
            id.to_string(),
            str_field(doc, "authorId")?,
            opt_str_field(doc, "description")?.unwrap_or_default(),
            string_list(doc, "images")?,
            count_field(doc, "likeCount")?,
            string_set(doc, "categories")?,
            craft_type(doc)?,
            ts_field(doc, "createdAt")?,
            ts_field(doc, "updatedAt")?,
        ))
    }
}

impl Entity for Draft {
    const COLLECTION: &'static str = "drafts";

    fn encode(&self) -> Document {
        object(json!({
            "authorId": self.author_id,
            "description": self.description,
            "images": self.images().as_slice(),
            "hasCarousel": self.images().has_carousel(),
            "categories": self.categories,
            "craftType": self.craft_type,
            "createdAt": millis(self.created_at),
            "updatedAt": millis(self.updated_at),
        }))
    }

    fn decode(id: &str, doc: &Document) -> DecodeResult<Self> {
        Ok(Draft::new(
            id.to_string(),
            str_field(doc, "authorId")?,
            opt_str_field(doc, "description")?.unwrap_or_default(),
            string_list(doc, "images")?,
            string_set(doc, "categories")?,
            craft_type(doc)?,
            ts_field(doc, "createdAt")?,
            ts_field(doc, "updatedAt")?,
        ))
    }
}

pub fn encode_interest(i: &Interest) -> Value {
    match i {
        Interest::Category(c) => json!(c),
        Interest::Sub { category, subcategory } => json!({ "category": category, "subcategory": subcategory }),
    }
}

fn decode_interest(v: &Value) -> DecodeResult<Interest> {
    match v {
        Value::String(s) => Ok(Interest::Category(s.clone())),
        Value::Object(map) => Ok(Interest::Sub {
            category: str_field(map, "category")?,
            subcategory: str_field(map, "subcategory")?,
        }),
        _ => Err(DecodeError::WrongType("interests")),
    }
}

impl Entity for UserProfile {
    const COLLECTION: &'static str = "users";

    fn encode(&self) -> Document {
        let interests: Vec<Value> = self.interests.iter().map(encode_interest).collect();
        object(json!({
            "username": self.username,
            "email": self.email,
            "displayName": self.display_name,
            "avatarUrl": self.avatar_url,
            "following": self.following,
            "posts": self.posts,
            "interests": interests,
            "createdAt": millis(self.created_at),
        }))
    }

    fn decode(id: &str, doc: &Document) -> DecodeResult<Self> {
        let interests = match doc.get("interests") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(decode_interest).collect::<DecodeResult<_>>()?,
            Some(_) => return Err(DecodeError::WrongType("interests")),
        };
        Ok(UserProfile {
            id: id.to_string(),
            username: str_field(doc, "username")?,
            email: opt_str_field(doc, "email")?.unwrap_or_default(),
            display_name: opt_str_field(doc, "displayName")?,
            avatar_url: opt_str_field(doc, "avatarUrl")?,
            following: string_list(doc, "following")?,
            posts: string_list(doc, "posts")?,
            interests,
            created_at: ts_field(doc, "createdAt")?,
        })
    }
}

impl Reaction {
    pub fn encode(&self) -> Document {
        object(json!({
            "postId": self.post_id,
            "userId": self.user_id,
            "createdAt": millis(self.created_at),
        }))
    }

    pub fn decode(id: &str, doc: &Document) -> DecodeResult<Self> {
        Ok(Reaction {
            id: id.to_string(),
            post_id: str_field(doc, "postId")?,
            user_id: str_field(doc, "userId")?,
            created_at: ts_field(doc, "createdAt")?,
        })
    }
}

impl Comment {
    /// Embedded comments carry their id inside the object.
    pub fn encode_embedded(&self) -> Value {
        let mut doc = self.encode();
        doc.insert("id".into(), json!(self.id));
        Value::Object(doc)
    }

    pub fn decode_embedded(v: &Value) -> DecodeResult<Self> {
        let doc = v.as_object().ok_or(DecodeError::WrongType("comments"))?;
        let id = str_field(doc, "id")?;
        Self::decode(&id, doc)
    }
}

impl Entity for Comment {
    const COLLECTION: &'static str = "comments";

    fn encode(&self) -> Document {
        object(json!({
            "postId": self.post_id,
            "userId": self.user_id,
            "username": self.username,
            "userImage": self.user_image,
            "content": self.content,
            "createdAt": millis(self.created_at),
            "likes": self.likes,
            "replies": self.replies,
        }))
    }

    fn decode(id: &str, doc: &Document) -> DecodeResult<Self> {
        Ok(Comment {
            id: id.to_string(),
            post_id: str_field(doc, "postId")?,
            user_id: str_field(doc, "userId")?,
            username: opt_str_field(doc, "username")?.unwrap_or_default(),
            user_image: opt_str_field(doc, "userImage")?,
            content: str_field(doc, "content")?,
            created_at: ts_field(doc, "createdAt")?,
            likes: count_field(doc, "likes")?,
            replies: string_list(doc, "replies")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_carousel_flag_is_not_trusted() {
        let doc = object(json!({
            "authorId": "a",
            "description": "socks",
            "images": ["1.png", "2.png"],
            "hasCarousel": false,
            "likeCount": 2,
            "createdAt": 1_700_000_000_000i64,
            "updatedAt": 1_700_000_000_000i64,
        }));
        let post = Post::decode("p1", &doc).unwrap();
        assert!(post.has_carousel());
        assert_eq!(post.craft_type, DEFAULT_CRAFT_TYPE);
        assert_eq!(post.encode()["hasCarousel"], json!(true));
    }

    #[test]
    fn negative_like_count_is_rejected() {
        let doc = object(json!({
            "authorId": "a",
            "likeCount": -1,
            "createdAt": 0,
            "updatedAt": 0,
        }));
        let err = Post::decode("p1", &doc).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid { field: "likeCount", .. }));
    }

    #[test]
    fn interests_accept_both_shapes() {
        let doc = object(json!({
            "username": "sam",
            "createdAt": 0,
            "interests": ["Quilting", {"category": "Fiber", "subcategory": "Knitting"}],
        }));
        let profile = UserProfile::decode("u1", &doc).unwrap();
        assert_eq!(profile.interests.len(), 2);
        assert_eq!(profile.encode()["interests"][1]["subcategory"], json!("Knitting"));
    }

    #[test]
    fn missing_author_is_an_error() {
        let doc = object(json!({ "createdAt": 0, "updatedAt": 0 }));
        assert!(matches!(Post::decode("p", &doc), Err(DecodeError::Missing("authorId"))));
    }
}
