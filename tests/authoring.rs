#![cfg(feature = "inmem-store")]

mod common;

use common::Harness;
use craftfeed::error::ServiceError;
use craftfeed::models::{NewPost, PostUpdate};

// Minimal 1x1 PNG
fn sample_png() -> Vec<u8> {
    vec![
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, // signature
        0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R', 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, b'I',
        b'D', b'A', b'T', 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A,
        0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
    ]
}

fn new_post(description: &str, images: &[&str]) -> NewPost {
    NewPost {
        description: description.into(),
        images: images.iter().map(|s| s.to_string()).collect(),
        categories: [" Knitting ", ""].iter().map(|s| s.to_string()).collect(),
        craft_type: None,
    }
}

#[tokio::test]
async fn draft_publishes_into_a_post_and_disappears() {
    let h = Harness::new();
    h.user("alice").await;
    let draft = h.authoring.create_draft("alice", new_post("", &["a.png"])).await.unwrap();
    assert!(!draft.has_carousel());

    let draft = h
        .authoring
        .update_draft(
            &draft.id,
            "alice",
            PostUpdate { description: Some("Cabled jumper".into()), images: Some(vec!["a.png".into(), "b.png".into()]), ..PostUpdate::default() },
        )
        .await
        .unwrap();
    assert!(draft.has_carousel());
    assert_eq!(h.authoring.list_drafts("alice").await.unwrap().len(), 1);

    let post = h.authoring.publish_draft(&draft.id, "alice").await.unwrap();
    assert_eq!(post.description, "Cabled jumper");
    assert!(post.has_carousel());
    assert_eq!(post.like_count, 0);
    assert_eq!(post.craft_type, "General");
    assert_eq!(post.categories.iter().collect::<Vec<_>>(), ["Knitting"]);

    assert!(matches!(h.repo.get_draft(&draft.id).await, Err(_)));
    assert!(h.authoring.list_drafts("alice").await.unwrap().is_empty());
    assert_eq!(h.repo.get_profile("alice").await.unwrap().posts, vec![post.id.clone()]);
}

#[tokio::test]
async fn publishing_needs_a_description() {
    let h = Harness::new();
    h.user("alice").await;
    let draft = h.authoring.create_draft("alice", new_post("  ", &[])).await.unwrap();
    let err = h.authoring.publish_draft(&draft.id, "alice").await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    assert!(h.repo.get_draft(&draft.id).await.is_ok());
    assert!(h.repo.get_profile("alice").await.unwrap().posts.is_empty());
}

#[tokio::test]
async fn drafts_belong_to_their_author() {
    let h = Harness::new();
    h.user("alice").await;
    let draft = h.authoring.create_draft("alice", new_post("mine", &[])).await.unwrap();
    for res in [
        h.authoring.get_draft(&draft.id, "bob").await.map(|_| ()),
        h.authoring.publish_draft(&draft.id, "bob").await.map(|_| ()),
        h.authoring.discard_draft(&draft.id, "bob").await,
    ] {
        assert!(matches!(res, Err(ServiceError::Unauthorized)));
    }
    h.authoring.discard_draft(&draft.id, "alice").await.unwrap();
    assert!(h.authoring.list_drafts("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn carousel_flag_tracks_every_image_edit() {
    let h = Harness::new();
    h.user("alice").await;
    let (a, b) = (common::owned_image("alice", "a.png"), common::owned_image("alice", "b.png"));
    let post = h.authoring.create_post("alice", new_post("bowl", &[a.as_str()])).await.unwrap();
    assert!(!post.has_carousel());

    let two = Some(vec![a.clone(), b.clone()]);
    let post = h
        .authoring
        .update_post(&post.id, "alice", PostUpdate { images: two, ..PostUpdate::default() })
        .await
        .unwrap();
    assert!(post.has_carousel());
    assert!(h.repo.get_post(&post.id).await.unwrap().has_carousel());

    let post = h
        .authoring
        .update_post(&post.id, "alice", PostUpdate { images: Some(vec![b.clone()]), ..PostUpdate::default() })
        .await
        .unwrap();
    assert!(!post.has_carousel());
    assert_eq!(post.images().cover(), Some(b.as_str()));
    assert_eq!(*h.blobs.deleted.lock().unwrap(), vec![a]);
}

#[tokio::test]
async fn only_the_author_edits_a_post() {
    let h = Harness::new();
    h.user("alice").await;
    let post = h.authoring.create_post("alice", new_post("bowl", &[])).await.unwrap();
    let err = h
        .authoring
        .update_post(&post.id, "bob", PostUpdate { description: Some("mine now".into()), ..PostUpdate::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
    assert_eq!(h.repo.get_post(&post.id).await.unwrap().description, "bowl");
}

#[tokio::test]
async fn edits_bump_updated_at_only() {
    let h = Harness::new();
    h.user("alice").await;
    h.post("p1", "alice", 1).await;
    let before = h.repo.get_post("p1").await.unwrap();
    let after = h
        .authoring
        .update_post("p1", "alice", PostUpdate { description: Some("new words".into()), ..PostUpdate::default() })
        .await
        .unwrap();
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);
}

#[tokio::test]
async fn posting_requires_a_profile_and_a_description() {
    let h = Harness::new();
    let err = h.authoring.create_post("stranger", new_post("hi", &[])).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound));
    h.user("alice").await;
    let err = h.authoring.create_post("alice", new_post("", &[])).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn image_uploads_are_content_addressed_per_uploader() {
    let h = Harness::new();
    let first = h.authoring.upload_image("alice", &sample_png()).await.unwrap();
    let again = h.authoring.upload_image("alice", &sample_png()).await.unwrap();
    let bobs = h.authoring.upload_image("bob", &sample_png()).await.unwrap();
    assert_eq!(first.url, again.url);
    assert_ne!(first.url, bobs.url);
    assert_eq!(first.hash, bobs.hash);
    assert_eq!(first.mime, "image/png");
    assert!(first.url.ends_with(&format!("{}.png", first.hash)));
    assert_eq!(h.blobs.objects.lock().unwrap().len(), 2);

    let err = h.authoring.upload_image("alice", b"plain text, not an image").await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn another_users_upload_cannot_be_attached() {
    let h = Harness::new();
    h.user("alice").await;
    h.user("mallory").await;
    let upload = h.authoring.upload_image("alice", &sample_png()).await.unwrap();
    let post = h.authoring.create_post("alice", new_post("quilt", &[upload.url.as_str()])).await.unwrap();

    let err = h.authoring.create_post("mallory", new_post("mine", &[upload.url.as_str()])).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
    let err = h.authoring.create_draft("mallory", new_post("", &[upload.url.as_str()])).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));

    let own = h.authoring.create_post("mallory", new_post("mine", &["https://elsewhere.example/x.png"])).await.unwrap();
    let err = h
        .authoring
        .update_post(&own.id, "mallory", PostUpdate { images: Some(vec![upload.url.clone()]), ..PostUpdate::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));

    // dropping an external image never touches the blob store
    h.authoring
        .update_post(&own.id, "mallory", PostUpdate { images: Some(vec![]), ..PostUpdate::default() })
        .await
        .unwrap();
    assert!(h.blobs.deleted.lock().unwrap().is_empty());
    assert!(h.blobs.objects.lock().unwrap().contains_key(&upload.url));
    assert_eq!(h.repo.get_post(&post.id).await.unwrap().images().cover(), Some(upload.url.as_str()));
}

#[tokio::test]
async fn edited_out_images_survive_while_a_draft_still_uses_them() {
    let h = Harness::new();
    h.user("alice").await;
    let img = common::owned_image("alice", "a.png");
    let post = h.authoring.create_post("alice", new_post("vase", &[img.as_str()])).await.unwrap();
    let draft = h.authoring.create_draft("alice", new_post("vase, take two", &[img.as_str()])).await.unwrap();

    h.authoring
        .update_post(&post.id, "alice", PostUpdate { images: Some(vec![]), ..PostUpdate::default() })
        .await
        .unwrap();
    assert!(h.blobs.deleted.lock().unwrap().is_empty());

    h.authoring.discard_draft(&draft.id, "alice").await.unwrap();
    h.authoring
        .update_post(&post.id, "alice", PostUpdate { images: Some(vec![img.clone()]), ..PostUpdate::default() })
        .await
        .unwrap();
    h.authoring
        .update_post(&post.id, "alice", PostUpdate { images: Some(vec![]), ..PostUpdate::default() })
        .await
        .unwrap();
    assert_eq!(*h.blobs.deleted.lock().unwrap(), vec![img]);
}
