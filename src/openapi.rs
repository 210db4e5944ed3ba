use crate::authoring::UploadedImage;
use crate::feed::FeedMode;
use crate::models::{AuthorInfo, Comment, Draft, FeedItem, Interest, NewPost, Post, PostUpdate, UserProfile};
use crate::routes::{CommentRequest, CreatedId, FeedPageBody, PublicProfile, SessionRequest, ToggleResponse, TokenResponse};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::start_session,
        crate::routes::refresh_token,
        crate::routes::me,
        crate::routes::set_interests,
        crate::routes::get_user,
        crate::routes::follow_user,
        crate::routes::unfollow_user,
        crate::routes::get_feed,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::like_post,
        crate::routes::unlike_post,
        crate::routes::save_post,
        crate::routes::unsave_post,
        crate::routes::list_comments,
        crate::routes::add_comment,
        crate::routes::delete_comment,
        crate::routes::list_drafts,
        crate::routes::create_draft,
        crate::routes::get_draft,
        crate::routes::update_draft,
        crate::routes::discard_draft,
        crate::routes::publish_draft,
        crate::routes::upload_image,
    ),
    components(schemas(
        Post, NewPost, PostUpdate, Draft, FeedItem, AuthorInfo, Comment, Interest, UserProfile,
        FeedMode, FeedPageBody, SessionRequest, TokenResponse, PublicProfile, ToggleResponse, CommentRequest,
        CreatedId, UploadedImage
    )),
    tags(
        (name = "feed", description = "Feed pages"),
        (name = "posts", description = "Posts, likes, saves and comments"),
        (name = "drafts", description = "Unpublished posts"),
    )
)]
pub struct ApiDoc;
