use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ServiceResult;
use crate::feed::{FeedMode, FeedSession};
use crate::models::{Id, Post};
use crate::schema::{fields, Entity};
use crate::store::{DocumentStore, Filter, OrderBy, Query, StoredDoc, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A post newer than the head of the session exists. The session is not
    /// touched; the client decides when to refresh.
    NewContentAvailable { newest_post_id: Id },
}

/// Watches the newest post and tells a feed session when it falls behind.
///
/// A post is news when it was created after every post the session shows,
/// whatever order the session sorts by. A watcher started for the Following
/// feed only watches authors the viewer followed at start; restart it after a
/// mode switch.
pub struct LiveUpdateWatcher {
    subscription: Option<Subscription>,
}

impl LiveUpdateWatcher {
    pub async fn start(
        store: &dyn DocumentStore,
        session: Arc<FeedSession>,
    ) -> ServiceResult<(Self, mpsc::UnboundedReceiver<FeedEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let primed = AtomicBool::new(false);
        let mut query = Query::new().order(OrderBy::desc(fields::CREATED_AT)).limit(1);
        if session.mode() == FeedMode::Following {
            let following = session.composer().profiles().following_ids(session.viewer()).await?;
            query = query.filter(Filter::is_in(fields::AUTHOR_ID, following));
        }
        let callback = Arc::new(move |docs: &[StoredDoc]| {
            // the first delivery is the state the session was loaded from
            if !primed.swap(true, Ordering::SeqCst) {
                return;
            }
            let Some(doc) = docs.first() else { return };
            let newest = match Post::decode(&doc.id, &doc.data) {
                Ok(post) => post,
                Err(e) => {
                    warn!(post_id = %doc.id, "unreadable post in live update: {e}");
                    return;
                }
            };
            let Some(shown) = session.newest_created_at() else { return };
            if newest.created_at > shown && !session.contains(&newest.id) {
                debug!(newest = %newest.id, "new content available");
                let _ = tx.send(FeedEvent::NewContentAvailable { newest_post_id: newest.id });
            }
        });
        let subscription = store.subscribe(Post::COLLECTION, query, callback).await?;
        Ok((Self { subscription: Some(subscription) }, rx))
    }

    pub fn is_running(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(sub) = self.subscription.take() {
            sub.unsubscribe();
        }
    }
}

impl Drop for LiveUpdateWatcher {
    fn drop(&mut self) {
        if self.subscription.is_some() {
            warn!("live update watcher dropped without stop()");
            self.stop();
        }
    }
}
