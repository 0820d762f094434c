//! Table change notifications. Subscribers are told *that* a table changed,
//! not *what* changed; clients reload the table on every event.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::Query;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Extension;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::auth::AdminAuth;
use crate::state::AppState;

const FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Students,
    AttendanceRecords,
    AdminAccounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub at: DateTime<Utc>,
}

pub trait ChangeNotifier {
    /// `None` subscribes to every table.
    fn subscribe(&self, table: Option<Table>) -> BoxStream<'static, ChangeEvent>;
}

#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, table: Table, kind: ChangeKind) {
        let event = ChangeEvent {
            table,
            kind,
            at: Utc::now(),
        };
        log::debug!("Change on {:?}: {:?}", table, kind);
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl ChangeNotifier for ChangeFeed {
    fn subscribe(&self, table: Option<Table>) -> BoxStream<'static, ChangeEvent> {
        stream::unfold(self.sender.subscribe(), move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if table.map_or(true, |t| t == event.table) => {
                        return Some((event, rx))
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Change subscriber lagged behind by {} events", missed);
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangeQuery {
    pub table: Option<Table>,
}

pub async fn change_stream(
    _auth: AdminAuth,
    Query(query): Query<ChangeQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state.feed.subscribe(query.table).map(|change| {
        Ok(Event::default()
            .event("change")
            .data(serde_json::to_string(&change).unwrap_or_default()))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
