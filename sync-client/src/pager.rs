//! Paged message history.
//!
//! The visible window is `pages_to_load * page_size` messages, newest
//! first, always read from the store. Older pages come from the cache when
//! it holds them and from the server otherwise.

use tidings_sync_core::PagePlan;
use tidings_sync_types::{ClientMessage, Get, Message, MetaQuery, TopicName};
use tracing::debug;

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::session::Session;
use crate::transport::Transport;

/// Serves the visible window of a topic.
pub struct PageLoader<'a, T: Transport> {
    session: &'a Session<T>,
}

impl<'a, T: Transport> PageLoader<'a, T> {
    pub(crate) fn new(session: &'a Session<T>) -> Self {
        Self { session }
    }

    /// Start viewing `topic` with a single page and load it.
    pub async fn open(&self, topic: &TopicName) -> Result<Vec<Message>, ClientError> {
        self.session.with_pager(topic, |pager| pager.reset());
        self.load_visible(topic).await
    }

    /// Load the current window from the store.
    pub async fn load_visible(&self, topic: &TopicName) -> Result<Vec<Message>, ClientError> {
        let window = self.session.with_pager(topic, |pager| pager.window());
        let messages = self.session.store().msg_query(topic, window).await?;
        self.session.emit(ClientEvent::MessagesLoaded {
            topic: topic.clone(),
            messages: messages.clone(),
        });
        Ok(messages)
    }

    /// Grow the window by one page.
    ///
    /// Served from the cache when it holds more than the current window;
    /// otherwise one page is fetched from the server unless the full history
    /// is already cached.
    pub async fn load_older(&self, topic: &TopicName) -> Result<Vec<Message>, ClientError> {
        let store = self.session.store();
        let total = store.msg_count(topic).await?;
        let all_loaded = store
            .topic_get(topic)
            .await?
            .map(|t| t.all_loaded)
            .unwrap_or(false);

        match self
            .session
            .with_pager(topic, |pager| pager.plan_older(total, all_loaded))
        {
            PagePlan::GrowFromCache => {}
            PagePlan::FetchRemote { limit } => self.fetch_page(topic, limit).await?,
            PagePlan::Exhausted => debug!("History of {} is fully loaded", topic),
        }
        self.load_visible(topic).await
    }

    async fn fetch_page(&self, topic: &TopicName, limit: u32) -> Result<(), ClientError> {
        let store = self.session.store();
        let before = store.cached_range(topic).await?.map(|range| range.low());
        let count_before = store.msg_count(topic).await?;

        let request = ClientMessage::Get(Get {
            id: self.session.next_request_id(),
            topic: topic.clone(),
            query: MetaQuery::new().with_earlier_data(before, limit),
        });
        self.session.exchange(request).await?;

        let merged = store.msg_count(topic).await?.saturating_sub(count_before);
        debug!("Fetched {} older message(s) for {}", merged, topic);
        if merged < u64::from(limit) {
            store.set_all_loaded(topic, true).await?;
        }
        self.session
            .with_pager(topic, |pager| pager.fetched(merged as usize));
        Ok(())
    }
}
