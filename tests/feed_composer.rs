#![cfg(feature = "inmem-store")]

mod common;

use common::{ids, Harness};
use craftfeed::error::ServiceError;
use craftfeed::feed::{FeedFilters, FeedMode};

#[tokio::test]
async fn following_feed_pages_newest_first() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    h.user("bob").await;
    h.profiles.follow("viewer", "alice").await.unwrap();
    h.post("p1", "alice", 1).await;
    h.post("p2", "alice", 2).await;
    h.post("p3", "alice", 3).await;
    h.post("b1", "bob", 4).await;

    let filters = FeedFilters::default();
    let first = h.composer.fetch_page("viewer", FeedMode::Following, &filters, None, Some(2)).await.unwrap();
    assert_eq!(ids(&first.items), ["p3", "p2"]);
    assert!(first.has_more);

    let cursor = first.next_cursor.expect("cursor for a full page");
    let second = h
        .composer
        .fetch_page("viewer", FeedMode::Following, &filters, Some(&cursor), Some(2))
        .await
        .unwrap();
    assert_eq!(ids(&second.items), ["p1"]);
    assert!(!second.has_more);
    assert!(second.next_cursor.is_none());
}

#[tokio::test]
async fn following_nobody_is_an_empty_page() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    h.post("p1", "alice", 1).await;

    let page = h
        .composer
        .fetch_page("viewer", FeedMode::Following, &FeedFilters::default(), None, Some(5))
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert!(!page.has_more);
}

#[tokio::test]
async fn trending_orders_by_likes_then_recency() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    h.post_with("old_popular", "alice", 1, 9, &[], "x").await;
    h.post_with("new_popular", "alice", 5, 9, &[], "x").await;
    h.post_with("quiet", "alice", 9, 1, &[], "x").await;
    h.post_with("middling", "alice", 3, 4, &[], "x").await;

    let page = h
        .composer
        .fetch_page("viewer", FeedMode::Trending, &FeedFilters::default(), None, Some(10))
        .await
        .unwrap();
    assert_eq!(ids(&page.items), ["new_popular", "old_popular", "middling", "quiet"]);
    let counts: Vec<i64> = page.items.iter().map(|i| i.post.like_count).collect();
    assert!(counts.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn for_you_category_filter_overfetches_and_may_come_up_short() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    // 10 posts in total, 4 tagged Knitting
    for i in 0..10 {
        let cats: &[&str] = if i % 3 == 0 { &["Knitting"] } else { &["Pottery"] };
        h.post_with(&format!("p{i:02}"), "alice", i, 0, cats, "x").await;
    }

    let filters = FeedFilters::categories(["Knitting"]);
    let page = h.composer.fetch_page("viewer", FeedMode::ForYou, &filters, None, Some(5)).await.unwrap();
    // 15 requested, 10 available: the batch is short so there is nothing more
    assert_eq!(ids(&page.items), ["p09", "p06", "p03", "p00"]);
    assert!(!page.has_more);
}

#[tokio::test]
async fn same_cursor_gives_the_same_page() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    for i in 0..7 {
        h.post(&format!("p{i}"), "alice", i).await;
    }
    let filters = FeedFilters::default();
    let first = h.composer.fetch_page("viewer", FeedMode::ForYou, &filters, None, Some(3)).await.unwrap();
    let cursor = first.next_cursor.unwrap();
    let a = h.composer.fetch_page("viewer", FeedMode::ForYou, &filters, Some(&cursor), Some(3)).await.unwrap();
    let b = h.composer.fetch_page("viewer", FeedMode::ForYou, &filters, Some(&cursor), Some(3)).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(ids(&a.items), ["p3", "p2", "p1"]);
}

#[tokio::test]
async fn equal_timestamps_page_without_gaps_or_repeats() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    for id in ["a", "b", "c", "d", "e"] {
        h.post(id, "alice", 1).await;
    }
    let filters = FeedFilters::default();
    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = h
            .composer
            .fetch_page("viewer", FeedMode::ForYou, &filters, cursor.as_ref(), Some(2))
            .await
            .unwrap();
        seen.extend(page.items.iter().map(|i| i.post.id.clone()));
        if !page.has_more {
            break;
        }
        cursor = page.next_cursor;
    }
    assert_eq!(seen, ["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn cursor_from_another_mode_is_rejected() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    for i in 0..4 {
        h.post(&format!("p{i}"), "alice", i).await;
    }
    let filters = FeedFilters::default();
    let page = h.composer.fetch_page("viewer", FeedMode::Trending, &filters, None, Some(2)).await.unwrap();
    let cursor = page.next_cursor.unwrap();
    let err = h
        .composer
        .fetch_page("viewer", FeedMode::ForYou, &filters, Some(&cursor), Some(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn missing_author_gets_a_placeholder() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    h.post("p1", "alice", 1).await;
    h.post("p2", "ghost", 2).await;

    let page = h
        .composer
        .fetch_page("viewer", FeedMode::ForYou, &FeedFilters::default(), None, Some(10))
        .await
        .unwrap();
    assert_eq!(ids(&page.items), ["p2", "p1"]);
    assert!(page.items[0].author.is_placeholder());
    assert_eq!(page.items[1].author.display_name, "alice the crafter");
}

#[tokio::test]
async fn search_applies_in_every_mode() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    h.profiles.follow("viewer", "alice").await.unwrap();
    h.post_with("scarf", "alice", 1, 3, &["Knitting"], "Cosy SCARF in merino").await;
    h.post_with("vase", "alice", 2, 5, &["Pottery"], "Wheel thrown vase").await;

    let filters = FeedFilters::default().with_search("scarf");
    for mode in [FeedMode::ForYou, FeedMode::Following, FeedMode::Trending] {
        let page = h.composer.fetch_page("viewer", mode, &filters, None, Some(10)).await.unwrap();
        assert_eq!(ids(&page.items), ["scarf"], "mode {}", mode.as_str());
    }
}

#[tokio::test]
async fn categories_are_ignored_outside_for_you() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    h.post_with("scarf", "alice", 1, 3, &["Knitting"], "x").await;
    h.post_with("vase", "alice", 2, 5, &["Pottery"], "x").await;

    let filters = FeedFilters::categories(["Knitting"]);
    let page = h.composer.fetch_page("viewer", FeedMode::Trending, &filters, None, Some(10)).await.unwrap();
    assert_eq!(ids(&page.items), ["vase", "scarf"]);
}

#[tokio::test]
async fn zero_page_size_is_rejected_and_large_ones_are_capped() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    for i in 0..60 {
        h.post(&format!("p{i:02}"), "alice", i).await;
    }
    let filters = FeedFilters::default();
    let err = h.composer.fetch_page("viewer", FeedMode::ForYou, &filters, None, Some(0)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let page = h.composer.fetch_page("viewer", FeedMode::ForYou, &filters, None, Some(500)).await.unwrap();
    assert_eq!(page.items.len(), h.composer.config().max_page_size);
    assert!(page.has_more);
}

#[tokio::test]
async fn follow_takes_effect_on_the_next_page_request() {
    let h = Harness::new();
    h.user("viewer").await;
    h.user("alice").await;
    h.post("p1", "alice", 1).await;
    let filters = FeedFilters::default();

    let before = h.composer.fetch_page("viewer", FeedMode::Following, &filters, None, Some(5)).await.unwrap();
    assert!(before.items.is_empty());

    h.profiles.follow("viewer", "alice").await.unwrap();
    let after = h.composer.fetch_page("viewer", FeedMode::Following, &filters, None, Some(5)).await.unwrap();
    assert_eq!(ids(&after.items), ["p1"]);
}
