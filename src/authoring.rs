use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{Draft, NewPost, Post, PostUpdate};
use crate::profile::ProfileCache;
use crate::repo::{clean_categories, Repo};
use crate::storage::{image_path, image_prefix, BlobStore};

pub const IMAGE_SIZE_LIMIT: usize = 10 * 1024 * 1024;

const ALLOWED_IMAGES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// MIME type and extension of an accepted image, sniffed from its bytes.
pub fn sniff_image(bytes: &[u8]) -> Option<(&'static str, &'static str)> {
    let kind = infer::get(bytes)?;
    ALLOWED_IMAGES
        .contains(&kind.mime_type())
        .then(|| (kind.mime_type(), kind.extension()))
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadedImage {
    pub url: String,
    pub mime: String,
    pub size: usize,
    pub hash: String,
}

/// Drafts, publishing, post edits and image uploads.
#[derive(Clone)]
pub struct AuthoringService {
    repo: Arc<dyn Repo>,
    blobs: Arc<dyn BlobStore>,
    profiles: ProfileCache,
}

fn require_description(description: &str) -> ServiceResult<()> {
    if description.trim().is_empty() {
        return Err(ServiceError::Validation("description must not be empty".into()));
    }
    Ok(())
}

fn clean_new_post(mut new: NewPost) -> NewPost {
    new.categories = clean_categories(new.categories);
    new.images.retain(|url| !url.trim().is_empty());
    new
}

fn clean_update(mut upd: PostUpdate) -> PostUpdate {
    upd.categories = upd.categories.map(clean_categories);
    if let Some(images) = upd.images.as_mut() {
        images.retain(|url| !url.trim().is_empty());
    }
    upd
}

/// Images in our blob store must sit under the author's own prefix; other
/// URLs are external and left alone.
fn check_image_owner(blobs: &dyn BlobStore, owner_id: &str, images: &[String]) -> ServiceResult<()> {
    let prefix = image_prefix(owner_id);
    for url in images {
        if let Some(key) = blobs.key_of(url) {
            if !key.starts_with(&prefix) {
                warn!(owner_id, %url, "rejected image uploaded by another user");
                return Err(ServiceError::Unauthorized);
            }
        }
    }
    Ok(())
}

/// Delete those of `candidates` that the owner uploaded and that none of
/// their remaining posts or drafts still shows. Returns one message per
/// failure.
pub(crate) async fn release_images(
    repo: &dyn Repo,
    blobs: &dyn BlobStore,
    owner_id: &str,
    candidates: &[String],
) -> Vec<String> {
    let prefix = image_prefix(owner_id);
    let owned: Vec<&String> = candidates
        .iter()
        .filter(|url| blobs.key_of(url).is_some_and(|key| key.starts_with(&prefix)))
        .collect();
    if owned.is_empty() {
        return Vec::new();
    }

    let mut in_use: BTreeSet<String> = BTreeSet::new();
    match repo.posts_by_author(owner_id).await {
        Ok(posts) => in_use.extend(posts.iter().flat_map(|p| p.images().as_slice().to_vec())),
        Err(e) => return vec![format!("image references: {e}")],
    }
    match repo.list_drafts(owner_id).await {
        Ok(drafts) => in_use.extend(drafts.iter().flat_map(|d| d.images().as_slice().to_vec())),
        Err(e) => return vec![format!("image references: {e}")],
    }

    let mut failures = Vec::new();
    for url in owned.into_iter().filter(|url| !in_use.contains(*url)) {
        if let Err(e) = blobs.delete(url).await {
            failures.push(format!("image {url}: {e}"));
        }
    }
    failures
}

impl AuthoringService {
    pub fn new(repo: Arc<dyn Repo>, blobs: Arc<dyn BlobStore>, profiles: ProfileCache) -> Self {
        Self { repo, blobs, profiles }
    }

    pub async fn upload_image(&self, uploader_id: &str, bytes: &[u8]) -> ServiceResult<UploadedImage> {
        if bytes.is_empty() {
            return Err(ServiceError::Validation("empty upload".into()));
        }
        if bytes.len() > IMAGE_SIZE_LIMIT {
            return Err(ServiceError::Validation(format!("image exceeds {IMAGE_SIZE_LIMIT} bytes")));
        }
        let (mime, ext) = sniff_image(bytes)
            .ok_or_else(|| ServiceError::Validation("unsupported image type".into()))?;
        let hash = hex::encode(Sha256::digest(bytes));
        let url = self.blobs.upload(&image_path(uploader_id, &hash, ext), bytes, mime).await?;
        info!(uploader_id, %hash, size = bytes.len(), "image uploaded");
        Ok(UploadedImage { url, mime: mime.to_string(), size: bytes.len(), hash })
    }

    pub async fn create_draft(&self, author_id: &str, new: NewPost) -> ServiceResult<Draft> {
        check_image_owner(self.blobs.as_ref(), author_id, &new.images)?;
        Ok(self.repo.create_draft(author_id, clean_new_post(new)).await?)
    }

    async fn own_draft(&self, draft_id: &str, author_id: &str) -> ServiceResult<Draft> {
        let draft = self.repo.get_draft(draft_id).await?;
        if draft.author_id != author_id {
            return Err(ServiceError::Unauthorized);
        }
        Ok(draft)
    }

    pub async fn get_draft(&self, draft_id: &str, author_id: &str) -> ServiceResult<Draft> {
        self.own_draft(draft_id, author_id).await
    }

    pub async fn update_draft(&self, draft_id: &str, author_id: &str, upd: PostUpdate) -> ServiceResult<Draft> {
        let draft = self.own_draft(draft_id, author_id).await?;
        if upd.is_empty() {
            return Ok(draft);
        }
        if let Some(images) = &upd.images {
            check_image_owner(self.blobs.as_ref(), author_id, images)?;
        }
        Ok(self.repo.update_draft(draft_id, clean_update(upd)).await?)
    }

    pub async fn discard_draft(&self, draft_id: &str, author_id: &str) -> ServiceResult<()> {
        self.own_draft(draft_id, author_id).await?;
        self.repo.delete_draft(draft_id).await?;
        Ok(())
    }

    pub async fn list_drafts(&self, author_id: &str) -> ServiceResult<Vec<Draft>> {
        Ok(self.repo.list_drafts(author_id).await?)
    }

    /// Turn a draft into a post. The draft is removed once the post exists.
    pub async fn publish_draft(&self, draft_id: &str, author_id: &str) -> ServiceResult<Post> {
        let draft = self.own_draft(draft_id, author_id).await?;
        require_description(&draft.description)?;
        let post = self.create_post(author_id, draft.to_new_post()).await?;
        if let Err(e) = self.repo.delete_draft(draft_id).await {
            warn!(draft_id, post_id = %post.id, "published but draft not removed: {e}");
        }
        Ok(post)
    }

    pub async fn create_post(&self, author_id: &str, new: NewPost) -> ServiceResult<Post> {
        require_description(&new.description)?;
        check_image_owner(self.blobs.as_ref(), author_id, &new.images)?;
        // the author must have signed in once
        self.repo.get_profile(author_id).await?;
        let post = self.repo.create_post(author_id, clean_new_post(new)).await?;
        let appended = self.repo.add_post_ref(author_id, &post.id).await;
        self.profiles.invalidate(author_id);
        if let Err(e) = appended {
            warn!(post_id = %post.id, author_id, "post list append failed, removing post: {e}");
            self.repo.delete_post(&post.id).await?;
            return Err(e.into());
        }
        Ok(post)
    }

    /// Author-only edit. Images dropped from the post are deleted from the
    /// blob store unless another post or draft of the author still uses them.
    pub async fn update_post(&self, post_id: &str, requester_id: &str, upd: PostUpdate) -> ServiceResult<Post> {
        let before = self.repo.get_post(post_id).await?;
        if before.author_id != requester_id {
            return Err(ServiceError::Unauthorized);
        }
        if let Some(description) = &upd.description {
            require_description(description)?;
        }
        if let Some(images) = &upd.images {
            check_image_owner(self.blobs.as_ref(), requester_id, images)?;
        }
        if upd.is_empty() {
            return Ok(before);
        }
        let after = self.repo.update_post(post_id, clean_update(upd)).await?;

        let kept: BTreeSet<&String> = after.images().as_slice().iter().collect();
        let dropped: Vec<String> = before.images().as_slice().iter().filter(|u| !kept.contains(u)).cloned().collect();
        for failure in release_images(self.repo.as_ref(), self.blobs.as_ref(), requester_id, &dropped).await {
            warn!(post_id, "removed image left in blob store: {failure}");
        }
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[test]
    fn png_is_accepted_and_text_is_not() {
        assert_eq!(sniff_image(PNG_HEADER), Some(("image/png", "png")));
        assert_eq!(sniff_image(b"just some text"), None);
    }
}
