//! Console adapter
//!
//! Local stand-in for a chat platform. Reads one message per stdin line:
//!
//! ```text
//! <group_id> <user_id> [^<reply_to_id>] <text>
//! ```
//!
//! and prints everything the bot does to stdout.

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::adapter::{AdapterError, ChatAdapter, Dispatcher};
use crate::engine::{ChatEvent, LearningChat, SenderRole};

pub struct ConsoleAdapter {
    next_id: AtomicI64,
}

impl Default for ConsoleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleAdapter {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Parse an input line into an event stamped with `time`.
    /// `None` for blank or malformed lines.
    pub fn parse_line(&self, line: &str, time: i64) -> Option<ChatEvent> {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let group_id = parts.next()?.parse().ok()?;
        let user_id = parts.next()?.parse().ok()?;
        let mut text = parts.next()?.trim_start();

        let mut reply_to = None;
        if let Some(rest) = text.strip_prefix('^') {
            let (id, remainder) = rest.split_once(char::is_whitespace)?;
            reply_to = Some(id.parse().ok()?);
            text = remainder.trim_start();
        }
        if text.is_empty() {
            return None;
        }

        Some(ChatEvent {
            group_id,
            user_id,
            message_id: self.allocate_id(),
            raw_text: text.to_string(),
            plain_text: crate::message::plain_projection(text),
            time,
            role: SenderRole::Member,
            reply_to,
            to_me: false,
        })
    }
}

/// Feed input lines to the engine until EOF or `stop` completes, then wait
/// for every reply still in flight. Returns how many events were handled.
pub async fn serve_lines<R, S>(
    input: R,
    console: &ConsoleAdapter,
    engine: Arc<LearningChat>,
    dispatcher: Arc<Dispatcher>,
    stop: S,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(stop);
    let mut lines = input.lines();
    let mut tasks = JoinSet::new();
    let mut handled = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut stop => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let now = chrono::Utc::now().timestamp();
        let Some(event) = console.parse_line(&line, now) else {
            warn!("Expected \"<group_id> <user_id> <text>\", got: {}", line);
            continue;
        };
        handled += 1;

        let engine = engine.clone();
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move {
            match engine.answer(&event).await {
                Ok(Some(reply)) => {
                    dispatcher.send_replies(event.group_id, &[reply]).await;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to handle message {}: {}", event.message_id, e),
            }
        });
        // Drop finished handlers
        while tasks.try_join_next().is_some() {}
    }

    debug!("Input closed, waiting for {} replies", tasks.len());
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Message handler panicked: {}", e);
        }
    }
    Ok(handled)
}

#[async_trait]
impl ChatAdapter for ConsoleAdapter {
    fn name(&self) -> &str {
        "console"
    }

    async fn send_group_message(&self, group_id: i64, content: &str) -> Result<i64, AdapterError> {
        let id = self.allocate_id();
        println!("[{group_id}] #{id} bot: {content}");
        Ok(id)
    }

    async fn delete_message(&self, message_id: i64) -> Result<(), AdapterError> {
        println!("(message #{message_id} retracted)");
        Ok(())
    }

    async fn poke_user(&self, group_id: i64, user_id: i64) -> Result<(), AdapterError> {
        println!("[{group_id}] bot pokes {user_id}");
        Ok(())
    }
}
