use std::sync::Arc;
use actix_web::{web, HttpResponse};
use actix_multipart::Multipart;
use futures_util::TryStreamExt as _;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::{Auth, JwtKeys};
use crate::authoring::{sniff_image, AuthoringService, UploadedImage, IMAGE_SIZE_LIMIT};
use crate::engagement::{EngagementService, Toggle};
use crate::error::ApiError;
use crate::feed::{ComposerConfig, FeedComposer, FeedCursor, FeedFilters, FeedMode, FeedPage};
use crate::models::*;
use crate::profile::{ProfileCache, ProfileService};
use crate::rate_limit::RateLimiter;
use crate::repo::{CommentLayout, DocRepo, Repo};
use crate::storage::BlobStore;
use crate::store::DocumentStore;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/session").route(web::post().to(start_session)))
            .service(web::resource("/auth/refresh").route(web::post().to(refresh_token)))
            .service(web::resource("/me").route(web::get().to(me)))
            .service(web::resource("/me/interests").route(web::put().to(set_interests)))
            .service(web::resource("/feed").route(web::get().to(get_feed)))
            .service(web::resource("/posts").route(web::post().to(create_post)))
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::patch().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(
                web::resource("/posts/{id}/like")
                    .route(web::put().to(like_post))
                    .route(web::delete().to(unlike_post)),
            )
            .service(
                web::resource("/posts/{id}/save")
                    .route(web::put().to(save_post))
                    .route(web::delete().to(unsave_post)),
            )
            .service(
                web::resource("/posts/{id}/comments")
                    .route(web::get().to(list_comments))
                    .route(web::post().to(add_comment)),
            )
            .service(web::resource("/comments/{id}").route(web::delete().to(delete_comment)))
            .service(
                web::resource("/drafts")
                    .route(web::get().to(list_drafts))
                    .route(web::post().to(create_draft)),
            )
            .service(
                web::resource("/drafts/{id}")
                    .route(web::get().to(get_draft))
                    .route(web::patch().to(update_draft))
                    .route(web::delete().to(discard_draft)),
            )
            .service(web::resource("/drafts/{id}/publish").route(web::post().to(publish_draft)))
            .service(web::resource("/images").route(web::post().to(upload_image)))
            .service(web::resource("/users/{id}").route(web::get().to(get_user)))
            .service(
                web::resource("/users/{id}/follow")
                    .route(web::put().to(follow_user))
                    .route(web::delete().to(unfollow_user)),
            ),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub profiles: ProfileService,
    pub feed: FeedComposer,
    pub engagement: EngagementService,
    pub authoring: AuthoringService,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        comment_layout: CommentLayout,
        feed_config: ComposerConfig,
        rate_limiter: RateLimiter,
    ) -> Self {
        let repo: Arc<dyn Repo> = Arc::new(DocRepo::new(store).with_comment_layout(comment_layout));
        let cache = ProfileCache::with_limits(feed_config.profile_cache_ttl, feed_config.profile_cache_capacity);
        let profiles = ProfileService::new(repo.clone(), cache.clone());
        Self {
            feed: FeedComposer::new(repo.clone(), profiles.clone(), feed_config),
            engagement: EngagementService::new(repo.clone(), blobs.clone(), cache.clone()),
            authoring: AuthoringService::new(repo.clone(), blobs, cache),
            profiles,
            repo,
            rate_limiter,
        }
    }
}

// ---------------- session & profile -------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(default)]
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/session",
    request_body = SessionRequest,
    responses(
        (status = 200, description = "Profile of the signed-in user, created on first sign-in", body = UserProfile),
        (status = 401, description = "Missing or invalid token")
    )
)]
pub async fn start_session(auth: Auth, data: web::Data<AppState>, payload: web::Json<SessionRequest>) -> Result<HttpResponse, ApiError> {
    let req = payload.into_inner();
    let new = NewProfile {
        username: auth.0.name.clone(),
        email: req.email,
        display_name: req.display_name,
        avatar_url: req.avatar_url,
    };
    let profile = data.profiles.sign_in(auth.user_id(), new).await?;
    Ok(HttpResponse::Ok().json(profile))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub token: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    responses((status = 200, description = "Fresh 24h token for the same identity", body = TokenResponse), (status = 401, description = "Missing or invalid token"))
)]
pub async fn refresh_token(auth: Auth, keys: web::Data<JwtKeys>) -> Result<HttpResponse, ApiError> {
    let token = keys.issue(&auth.0.sub, &auth.0.name).map_err(|e| {
        tracing::error!("token issue failed: {e}");
        ApiError::Internal
    })?;
    Ok(HttpResponse::Ok().json(TokenResponse { token }))
}

#[utoipa::path(
    get,
    path = "/api/v1/me",
    responses((status = 200, description = "Own profile", body = UserProfile), (status = 404, description = "Not signed in yet"))
)]
pub async fn me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let profile = data.profiles.profile(auth.user_id()).await?;
    Ok(HttpResponse::Ok().json(profile.as_ref()))
}

#[utoipa::path(
    put,
    path = "/api/v1/me/interests",
    request_body = Vec<Interest>,
    responses((status = 204, description = "Interests replaced"), (status = 400, description = "Blank interest"))
)]
pub async fn set_interests(auth: Auth, data: web::Data<AppState>, payload: web::Json<Vec<Interest>>) -> Result<HttpResponse, ApiError> {
    data.profiles.set_interests(auth.user_id(), payload.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// What other users see of a profile.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub author: AuthorInfo,
    pub username: String,
    pub following_total: usize,
    pub post_total: usize,
    pub posts: Vec<Id>,
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{id}",
    params(("id" = Id, Path, description = "User id")),
    responses((status = 200, description = "Public profile", body = PublicProfile), (status = 404, description = "Unknown user"))
)]
pub async fn get_user(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let profile = data.repo.get_profile(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(PublicProfile {
        author: profile.author_info(),
        following_total: profile.following.len(),
        post_total: profile.posts.len(),
        username: profile.username,
        posts: profile.posts,
    }))
}

#[utoipa::path(
    put,
    path = "/api/v1/users/{id}/follow",
    params(("id" = Id, Path, description = "User to follow")),
    responses((status = 204, description = "Following"), (status = 400, description = "Self follow"), (status = 404, description = "Unknown user"))
)]
pub async fn follow_user(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.profiles.follow(auth.user_id(), &path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}/follow",
    params(("id" = Id, Path, description = "User to unfollow")),
    responses((status = 204, description = "Not following"))
)]
pub async fn unfollow_user(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.profiles.unfollow(auth.user_id(), &path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- feed ---------------------------------------------

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct FeedParams {
    /// `forYou` (default), `following` or `trending`.
    pub mode: Option<FeedMode>,
    /// Comma separated category names (forYou only).
    pub categories: Option<String>,
    /// Use the viewer's declared interests as category filters.
    pub use_interests: Option<bool>,
    pub search: Option<String>,
    /// `nextCursor` of the previous page.
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedPageBody {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl From<FeedPage> for FeedPageBody {
    fn from(page: FeedPage) -> Self {
        Self {
            items: page.items,
            next_cursor: page.next_cursor.as_ref().map(FeedCursor::encode),
            has_more: page.has_more,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/feed",
    params(FeedParams),
    responses(
        (status = 200, description = "One feed page", body = FeedPageBody),
        (status = 400, description = "Bad cursor or page size")
    )
)]
pub async fn get_feed(auth: Auth, data: web::Data<AppState>, query: web::Query<FeedParams>) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    let mode = params.mode.unwrap_or_default();
    let mut filters = FeedFilters {
        categories: params
            .categories
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        search: params.search,
    };
    if params.use_interests.unwrap_or(false) {
        filters.categories.extend(data.feed.interest_filters(auth.user_id()).await?);
    }
    let cursor = params.cursor.as_deref().map(FeedCursor::decode).transpose()?;
    let page = data.feed.fetch_page(auth.user_id(), mode, &filters, cursor.as_ref(), params.page_size).await?;
    Ok(HttpResponse::Ok().json(FeedPageBody::from(page)))
}

// ---------------- posts --------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = NewPost,
    responses((status = 201, description = "Post created", body = Post), (status = 400, description = "Empty description"))
)]
pub async fn create_post(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewPost>) -> Result<HttpResponse, ApiError> {
    let post = data.authoring.create_post(auth.user_id(), payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(post))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Post with author", body = FeedItem), (status = 404, description = "Post not found"))
)]
pub async fn get_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let item = data.feed.item(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(item))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{id}",
    request_body = PostUpdate,
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post updated", body = Post),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn update_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<PostUpdate>) -> Result<HttpResponse, ApiError> {
    let post = data.authoring.update_post(&path.into_inner(), auth.user_id(), payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 204, description = "Post and its likes, saves and comments deleted"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Post not found"),
        (status = 500, description = "Post deleted but some dependent records remain")
    )
)]
pub async fn delete_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.engagement.delete_post(&path.into_inner(), auth.user_id()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToggleResponse {
    /// False when the request matched the existing state.
    pub changed: bool,
    pub active: bool,
}

fn toggled(t: Toggle, active: bool) -> HttpResponse {
    HttpResponse::Ok().json(ToggleResponse { changed: t == Toggle::Applied, active })
}

#[utoipa::path(
    put,
    path = "/api/v1/posts/{id}/like",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Liked", body = ToggleResponse), (status = 404, description = "Post not found"), (status = 429, description = "Rate limited"))
)]
pub async fn like_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    if !data.rate_limiter.allow_like(auth.user_id()) { return Err(ApiError::TooManyRequests); }
    let t = data.engagement.like(&path.into_inner(), auth.user_id()).await?;
    Ok(toggled(t, true))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}/like",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Not liked", body = ToggleResponse))
)]
pub async fn unlike_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    if !data.rate_limiter.allow_like(auth.user_id()) { return Err(ApiError::TooManyRequests); }
    let t = data.engagement.unlike(&path.into_inner(), auth.user_id()).await?;
    Ok(toggled(t, false))
}

#[utoipa::path(
    put,
    path = "/api/v1/posts/{id}/save",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Saved", body = ToggleResponse), (status = 404, description = "Post not found"))
)]
pub async fn save_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let t = data.engagement.save(&path.into_inner(), auth.user_id()).await?;
    Ok(toggled(t, true))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}/save",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Not saved", body = ToggleResponse))
)]
pub async fn unsave_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let t = data.engagement.unsave(&path.into_inner(), auth.user_id()).await?;
    Ok(toggled(t, false))
}

// ---------------- comments -----------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CommentRequest {
    pub content: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedId {
    pub id: Id,
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/comments",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Comments, oldest first", body = [Comment]))
)]
pub async fn list_comments(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let comments = data.engagement.comments(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(comments))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/comments",
    request_body = CommentRequest,
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 201, description = "Comment added", body = CreatedId),
        (status = 400, description = "Empty comment"),
        (status = 404, description = "Post not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn add_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<CommentRequest>) -> Result<HttpResponse, ApiError> {
    if !data.rate_limiter.allow_comment(auth.user_id()) { return Err(ApiError::TooManyRequests); }
    let profile = data.profiles.profile(auth.user_id()).await?;
    let new = NewComment {
        user_id: profile.id.clone(),
        username: profile.username.clone(),
        user_image: profile.avatar_url.clone(),
        content: payload.into_inner().content,
    };
    let id = data.engagement.add_comment(&path.into_inner(), new).await?;
    Ok(HttpResponse::Created().json(CreatedId { id }))
}

#[utoipa::path(
    delete,
    path = "/api/v1/comments/{id}",
    params(("id" = Id, Path, description = "Comment id")),
    responses(
        (status = 204, description = "Comment deleted"),
        (status = 403, description = "Neither comment author nor post author"),
        (status = 404, description = "Comment not found")
    )
)]
pub async fn delete_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.engagement.delete_comment(&path.into_inner(), auth.user_id()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- drafts -------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/drafts",
    responses((status = 200, description = "Own drafts, most recently edited first", body = [Draft]))
)]
pub async fn list_drafts(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.authoring.list_drafts(auth.user_id()).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/drafts",
    request_body = NewPost,
    responses((status = 201, description = "Draft created", body = Draft))
)]
pub async fn create_draft(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewPost>) -> Result<HttpResponse, ApiError> {
    let draft = data.authoring.create_draft(auth.user_id(), payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(draft))
}

#[utoipa::path(
    get,
    path = "/api/v1/drafts/{id}",
    params(("id" = Id, Path, description = "Draft id")),
    responses((status = 200, description = "Draft", body = Draft), (status = 403, description = "Not yours"), (status = 404, description = "Draft not found"))
)]
pub async fn get_draft(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.authoring.get_draft(&path.into_inner(), auth.user_id()).await?))
}

#[utoipa::path(
    patch,
    path = "/api/v1/drafts/{id}",
    request_body = PostUpdate,
    params(("id" = Id, Path, description = "Draft id")),
    responses((status = 200, description = "Draft updated", body = Draft), (status = 403, description = "Not yours"))
)]
pub async fn update_draft(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<PostUpdate>) -> Result<HttpResponse, ApiError> {
    let draft = data.authoring.update_draft(&path.into_inner(), auth.user_id(), payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(draft))
}

#[utoipa::path(
    delete,
    path = "/api/v1/drafts/{id}",
    params(("id" = Id, Path, description = "Draft id")),
    responses((status = 204, description = "Draft discarded"), (status = 403, description = "Not yours"))
)]
pub async fn discard_draft(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.authoring.discard_draft(&path.into_inner(), auth.user_id()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/v1/drafts/{id}/publish",
    params(("id" = Id, Path, description = "Draft id")),
    responses(
        (status = 201, description = "Published; the draft is gone", body = Post),
        (status = 400, description = "Draft has no description"),
        (status = 403, description = "Not yours")
    )
)]
pub async fn publish_draft(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let post = data.authoring.publish_draft(&path.into_inner(), auth.user_id()).await?;
    Ok(HttpResponse::Created().json(post))
}

// ---------------- images -------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/images",
    responses(
        (status = 201, description = "Image stored", body = UploadedImage),
        (status = 413, description = "Payload too large"),
        (status = 415, description = "Unsupported media type"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn upload_image(auth: Auth, data: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, ApiError> {
    if !data.rate_limiter.allow_upload(auth.user_id()) { return Err(ApiError::TooManyRequests); }
    while let Some(mut field) = payload.try_next().await.map_err(|e| {
        tracing::error!("multipart error: {e}");
        ApiError::BadRequest("malformed multipart body".into())
    })? {
        if field.content_disposition().get_name() != Some("file") { continue; }
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(|e| {
            tracing::error!("stream read error: {e}");
            ApiError::BadRequest("upload interrupted".into())
        })? {
            if bytes.len() + chunk.len() > IMAGE_SIZE_LIMIT { return Err(ApiError::PayloadTooLarge); }
            bytes.extend_from_slice(&chunk);
        }
        if sniff_image(&bytes).is_none() { return Err(ApiError::UnsupportedMediaType); }
        let uploaded = data.authoring.upload_image(auth.user_id(), &bytes).await?;
        return Ok(HttpResponse::Created().json(uploaded));
    }
    Err(ApiError::BadRequest("missing `file` field".into()))
}
