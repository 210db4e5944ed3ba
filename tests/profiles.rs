#![cfg(feature = "inmem-store")]

mod common;

use std::time::Duration;

use common::Harness;
use craftfeed::error::ServiceError;
use craftfeed::models::{Interest, NewPost, NewProfile};
use craftfeed::profile::{ProfileCache, ProfileService};

fn profile(name: &str) -> NewProfile {
    NewProfile { username: name.into(), email: format!("{name}@example.com"), display_name: None, avatar_url: None }
}

#[tokio::test]
async fn first_sign_in_creates_and_later_ones_do_not_overwrite() {
    let h = Harness::new();
    let created = h.profiles.sign_in("u1", profile("sam")).await.unwrap();
    h.profiles.follow("u1", "u1").await.unwrap_err();
    h.user("u2").await;
    h.profiles.follow("u1", "u2").await.unwrap();

    let again = h.profiles.sign_in("u1", profile("renamed")).await.unwrap();
    assert_eq!(again.username, "sam");
    assert_eq!(again.created_at, created.created_at);
    assert_eq!(again.following, vec!["u2".to_string()]);
}

#[tokio::test]
async fn follow_rules() {
    let h = Harness::new();
    h.user("u1").await;
    h.user("u2").await;

    assert!(matches!(h.profiles.follow("u1", "u1").await, Err(ServiceError::Validation(_))));
    assert!(matches!(h.profiles.follow("u1", "nobody").await, Err(ServiceError::NotFound)));

    h.profiles.follow("u1", "u2").await.unwrap();
    h.profiles.follow("u1", "u2").await.unwrap();
    assert_eq!(h.profiles.following_ids("u1").await.unwrap(), vec!["u2".to_string()]);

    h.profiles.unfollow("u1", "u2").await.unwrap();
    assert!(h.profiles.following_ids("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn interests_become_category_filters() {
    let h = Harness::new();
    h.user("u1").await;
    assert!(h.composer.interest_filters("u1").await.unwrap().is_empty());

    h.profiles
        .set_interests(
            "u1",
            vec![
                Interest::Category("Quilting".into()),
                Interest::Sub { category: "Fiber".into(), subcategory: "Knitting".into() },
            ],
        )
        .await
        .unwrap();
    let filters: Vec<String> = h.composer.interest_filters("u1").await.unwrap().into_iter().collect();
    assert_eq!(filters, ["Fiber", "Knitting", "Quilting"]);

    let err = h.profiles.set_interests("u1", vec![Interest::Category(" ".into())]).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn blank_usernames_are_refused() {
    let h = Harness::new();
    let err = h.profiles.sign_in("u1", profile("")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn cached_profile_follows_posts_created_and_deleted() {
    let h = Harness::new();
    h.user("alice").await;
    assert!(h.profiles.profile("alice").await.unwrap().posts.is_empty());

    let post = h
        .authoring
        .create_post("alice", NewPost { description: "tea cosy".into(), ..NewPost::default() })
        .await
        .unwrap();
    assert_eq!(h.profiles.profile("alice").await.unwrap().posts, vec![post.id.clone()]);

    h.engagement.delete_post(&post.id, "alice").await.unwrap();
    assert!(h.profiles.profile("alice").await.unwrap().posts.is_empty());
}

#[tokio::test]
async fn expired_entries_reload_writes_from_elsewhere() {
    let h = Harness::new();
    h.user("u1").await;
    h.user("u2").await;
    let profiles = ProfileService::new(h.repo.clone(), ProfileCache::with_limits(Duration::ZERO, 10));
    assert!(profiles.following_ids("u1").await.unwrap().is_empty());

    // written around the cache, as another process would
    h.repo.add_following("u1", "u2").await.unwrap();
    assert_eq!(profiles.following_ids("u1").await.unwrap(), vec!["u2".to_string()]);
}

#[tokio::test]
async fn cache_stays_within_capacity() {
    let h = Harness::new();
    let cache = ProfileCache::with_limits(Duration::from_secs(60), 2);
    for id in ["u1", "u2", "u3"] {
        h.user(id).await;
        cache.get(h.repo.as_ref(), id).await.unwrap();
        assert!(cache.len() <= 2);
    }
    assert_eq!(cache.len(), 2);
}
