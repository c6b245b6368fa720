use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info};

use chatsync_store::{ChildQuery, Snapshot, StoreClient};
use chatsync_types::api::OlderPage;
use chatsync_types::models::Message;

use crate::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{Liveness, Subscription, WatchEvent, lock};
use crate::now_ms;
use crate::observer::{SyncEvent, SyncObserver};
use crate::paths;
use crate::resolver::MessageLocation;

/// Fields messages are ordered by, newest name first.
const ORDER_FIELDS: [&str; 2] = ["createdAt", "timestamp"];

/// Lifecycle of one open chat.
///
/// `Resolving` only exists inside [`MessageStream::open`]; a returned stream
/// starts in `Ready`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Resolving,
    /// Location known, no live listener
    Ready,
    Subscribed,
    Paginating,
    Closed,
}

/// Identity stamped on sent messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub username: String,
}

type MessagesCallback = Arc<dyn Fn(SyncResult<Vec<Message>>) + Send + Sync>;

struct Listener {
    liveness: Liveness,
    on_messages: MessagesCallback,
}

/// Live, ordered message window of one chat.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct MessageStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    store: Arc<dyn StoreClient>,
    observer: Arc<dyn SyncObserver>,
    chat_id: String,
    author: Author,
    location: MessageLocation,
    page_size: usize,
    state: Mutex<StreamState>,
    /// Every message seen so far, by id. Messages are immutable, so the
    /// window only grows until the stream closes.
    window: Mutex<HashMap<String, Message>>,
    listener: Mutex<Option<Listener>>,
    /// Held while delivering so windows reach the consumer in the order
    /// they were built.
    delivery: Mutex<()>,
    paging: tokio::sync::Mutex<()>,
    /// Summary updates of this stream run one at a time.
    summaries: Arc<tokio::sync::Mutex<()>>,
}

impl MessageStream {
    /// Resolve the chat's message location once and keep it for the life
    /// of the stream.
    pub async fn open(ctx: &SyncContext, chat_id: &str, author: Author) -> SyncResult<Self> {
        paths::validate_key("chat id", chat_id)?;
        paths::validate_key("author id", &author.id)?;

        debug!(chat_id, state = ?StreamState::Resolving, "opening message stream");
        let location = ctx.resolver.resolve(ctx.store.as_ref(), chat_id).await?;
        info!(chat_id, path = %location.path, "message stream open");

        Ok(Self {
            inner: Arc::new(StreamInner {
                store: ctx.store.clone(),
                observer: ctx.observer.clone(),
                chat_id: chat_id.to_string(),
                author,
                location,
                page_size: ctx.config.page_size.max(1),
                state: Mutex::new(StreamState::Ready),
                window: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                delivery: Mutex::new(()),
                paging: tokio::sync::Mutex::new(()),
                summaries: Arc::new(tokio::sync::Mutex::new(())),
            }),
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.inner.chat_id
    }

    pub fn location(&self) -> &MessageLocation {
        &self.inner.location
    }

    pub fn state(&self) -> StreamState {
        let state = *lock(&self.inner.state);
        // The caller may have released the listener directly.
        if state == StreamState::Subscribed && !self.has_live_listener() {
            return StreamState::Ready;
        }
        state
    }

    /// Current window in display order.
    pub fn window(&self) -> Vec<Message> {
        self.inner.sorted_window()
    }

    /// Attach the live listener for the newest page and deliver the full
    /// window on every change. A stream has one listener; subscribing again
    /// releases the previous one.
    pub async fn subscribe<F>(&self, on_messages: F) -> SyncResult<Subscription>
    where
        F: Fn(SyncResult<Vec<Message>>) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.release_listener();

        let query = ChildQuery::ordered_by(&ORDER_FIELDS).limit_to_last(self.inner.page_size);
        let on_messages: MessagesCallback = Arc::new(on_messages);
        let inner = self.inner.clone();
        let callback = on_messages.clone();

        let subscription = Subscription::attach(
            self.inner.store.clone(),
            self.inner.location.path.clone(),
            Some(query),
            format!("messages:{}", self.inner.chat_id),
            self.inner.observer.clone(),
            move |liveness| {
                move |event| match event {
                    WatchEvent::Snapshot(snapshot) => {
                        inner.merge(entries_of(&snapshot));
                        inner.deliver_to(&liveness, &callback);
                    }
                    WatchEvent::Failed(e) => {
                        if liveness.is_live() {
                            let _turn = lock(&inner.delivery);
                            callback(Err(e));
                        }
                    }
                }
            },
        )
        .await?;

        {
            let mut state = lock(&self.inner.state);
            if *state == StreamState::Closed {
                subscription.unsubscribe();
                return Err(SyncError::Closed);
            }
            if *state == StreamState::Ready {
                *state = StreamState::Subscribed;
            }
        }

        *lock(&self.inner.listener) = Some(Listener {
            liveness: subscription.liveness(),
            on_messages,
        });

        Ok(subscription)
    }

    /// Fetch one page older than the oldest held message and prepend it.
    ///
    /// `more` is true when a full page came back; the real boundary is only
    /// known once a later call returns a short or empty page. An empty
    /// window has nothing to page from and reports `more: false`.
    pub async fn load_older(&self) -> SyncResult<OlderPage> {
        let _paging = self.inner.paging.lock().await;

        {
            let mut state = lock(&self.inner.state);
            if *state == StreamState::Closed {
                return Err(SyncError::Closed);
            }
            *state = StreamState::Paginating;
        }

        let result = self.fetch_older().await;

        // A listener may have been attached or released while the page
        // was loading.
        let live = self.has_live_listener();
        {
            let mut state = lock(&self.inner.state);
            if *state == StreamState::Paginating {
                *state = if live {
                    StreamState::Subscribed
                } else {
                    StreamState::Ready
                };
            }
        }

        result
    }

    async fn fetch_older(&self) -> SyncResult<OlderPage> {
        let Some((oldest_at, oldest_id)) = self.inner.oldest() else {
            debug!(chat_id = %self.inner.chat_id, "window empty, nothing older to load");
            return Ok(OlderPage { more: false });
        };

        let query = ChildQuery::ordered_by(&ORDER_FIELDS)
            .end_before(oldest_at, &oldest_id)
            .limit_to_last(self.inner.page_size);
        let rows = self
            .inner
            .store
            .query(&self.inner.location.path, &query)
            .await?;

        if *lock(&self.inner.state) == StreamState::Closed {
            return Err(SyncError::Closed);
        }

        let fetched = rows.len();
        debug!(chat_id = %self.inner.chat_id, fetched, "loaded older page");

        if fetched > 0 {
            self.inner.merge(rows);
            let listener = lock(&self.inner.listener)
                .as_ref()
                .map(|l| (l.liveness.clone(), l.on_messages.clone()));
            if let Some((liveness, callback)) = listener {
                self.inner.deliver_to(&liveness, &callback);
            }
        }

        Ok(OlderPage {
            more: fetched == self.inner.page_size,
        })
    }

    /// Append a message at the resolved location.
    ///
    /// Blank input is ignored and returns `Ok(None)`. After the append the
    /// chat summary is updated in the background; its outcome is reported
    /// to the observer and never affects this result.
    pub async fn send(&self, body: &str) -> SyncResult<Option<String>> {
        let body = body.trim();
        if body.is_empty() {
            debug!(chat_id = %self.inner.chat_id, "ignoring blank message");
            return Ok(None);
        }
        self.ensure_open()?;

        let message = Message {
            id: String::new(),
            chat_id: self.inner.chat_id.clone(),
            sender_id: self.inner.author.id.clone(),
            sender_username: self.inner.author.username.clone(),
            body: body.to_string(),
            created_at: now_ms(),
        };

        let message_id = self
            .inner
            .store
            .append(&self.inner.location.path, message.to_record())
            .await?;
        debug!(chat_id = %self.inner.chat_id, message_id = %message_id, "message sent");

        tokio::spawn(update_summary(
            self.inner.store.clone(),
            self.inner.observer.clone(),
            self.inner.summaries.clone(),
            SummaryUpdate {
                chat_id: self.inner.chat_id.clone(),
                message_id: message_id.clone(),
                body: message.body,
                sent_at: message.created_at,
            },
        ));

        Ok(Some(message_id))
    }

    /// Terminal. Releases the live listener; later calls fail with
    /// [`SyncError::Closed`]. Safe to call more than once.
    pub fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == StreamState::Closed {
                return;
            }
            *state = StreamState::Closed;
        }
        self.release_listener();
        lock(&self.inner.window).clear();
        info!(chat_id = %self.inner.chat_id, "message stream closed");
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if *lock(&self.inner.state) == StreamState::Closed {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    fn has_live_listener(&self) -> bool {
        lock(&self.inner.listener)
            .as_ref()
            .is_some_and(|l| l.liveness.is_live())
    }

    fn release_listener(&self) {
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.liveness.release();
        }
    }
}

impl StreamInner {
    fn merge(&self, rows: Vec<(String, Value)>) {
        if *lock(&self.state) == StreamState::Closed {
            return;
        }
        let mut window = lock(&self.window);
        for (id, raw) in rows {
            let message = Message::from_raw(&id, &self.chat_id, &raw);
            window.insert(id, message);
        }
    }

    fn sorted_window(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = lock(&self.window).values().cloned().collect();
        sort_messages(&mut messages);
        messages
    }

    fn oldest(&self) -> Option<(i64, String)> {
        lock(&self.window)
            .values()
            .min_by(|a, b| a.sort_key().cmp(&b.sort_key()))
            .map(|m| (m.created_at, m.id.clone()))
    }

    fn deliver_to(&self, liveness: &Liveness, callback: &MessagesCallback) {
        let _turn = lock(&self.delivery);
        if !liveness.is_live() {
            return;
        }
        callback(Ok(self.sorted_window()));
    }
}

fn entries_of(snapshot: &Snapshot) -> Vec<(String, Value)> {
    match snapshot {
        Some(Value::Object(children)) => children
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Ascending by creation time; equal timestamps by store key.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

struct SummaryUpdate {
    chat_id: String,
    message_id: String,
    body: String,
    sent_at: i64,
}

/// Point the chat summary at a sent message unless it already shows a newer
/// one. Message ids are time-ordered, so `(lastMessageAt, lastMessageId)`
/// orders summaries the way the window orders messages.
async fn update_summary(
    store: Arc<dyn StoreClient>,
    observer: Arc<dyn SyncObserver>,
    turn: Arc<tokio::sync::Mutex<()>>,
    update: SummaryUpdate,
) {
    let _turn = turn.lock().await;
    let SummaryUpdate {
        chat_id,
        message_id,
        body,
        sent_at,
    } = update;

    let result = async {
        // Never conjure a chat record out of a summary write.
        if !store.exists(&paths::chat(&chat_id)).await? {
            return Err(SyncError::NotFound(format!("chat {}", chat_id)));
        }

        let shown_at = store
            .read(&paths::chat_field(&chat_id, "lastMessageAt"))
            .await?
            .as_ref()
            .and_then(loose_i64);
        if let Some(shown_at) = shown_at {
            let shown_id = match store
                .read(&paths::chat_field(&chat_id, "lastMessageId"))
                .await?
            {
                Some(Value::String(id)) => id,
                _ => String::new(),
            };
            if (shown_at, shown_id.as_str()) >= (sent_at, message_id.as_str()) {
                return Ok(false);
            }
        }

        store
            .write(&paths::chat_field(&chat_id, "lastMessage"), Value::String(body))
            .await?;
        store
            .write(
                &paths::chat_field(&chat_id, "lastMessageId"),
                Value::String(message_id.clone()),
            )
            .await?;
        store
            .write(&paths::chat_field(&chat_id, "lastMessageAt"), Value::from(sent_at))
            .await?;
        Ok::<_, SyncError>(true)
    }
    .await;

    let event = match result {
        Ok(true) => SyncEvent::SummaryUpdated { chat_id, message_id },
        Ok(false) => SyncEvent::SummarySuperseded { chat_id, message_id },
        Err(e) => SyncEvent::SummaryUpdateFailed {
            chat_id,
            message_id,
            error: e.to_string(),
        },
    };
    observer.observe(event);
}

fn loose_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
