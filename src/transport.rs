//! Real-time transport (§4.F), replacing the teacher's `processor.rs`.
//!
//! The teacher polls all connections from a single `FuturesUnordered` loop
//! (`processor()`); this redesign follows §4.F/§9's note instead: one task
//! per open channel for reads, one task per open channel for writes (each
//! owning a bounded outbound queue), and one task per `LiveSession` for
//! the serialized state loop (`server::LiveSession::run`). The three
//! communicate only through bounded channels/queues — no shared mutable
//! state crosses a session boundary.
use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::payloads::{InboundMsg, OutboundMsg};
use crate::{debug, error, warn};

/// Bounded, priority-aware outbound mailbox for one connected client.
/// Plain `tokio::sync::mpsc` cannot selectively evict a queued item, so
/// the queue is owned directly and protected by a mutex; a `Notify`
/// wakes the writer task when a frame is pushed.
pub struct OutboundQueue {
  inner: AsyncMutex<VecDeque<OutboundMsg>>,
  notify: Notify,
  capacity: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
  Queued,
  DroppedOlderNonCritical,
  QueueFullDisconnect,
}

impl OutboundQueue {
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    OutboundQueue { inner: AsyncMutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity }
  }

  /// §4.F backpressure: if full, drop the oldest non-critical frame
  /// before the new one; if nothing droppable remains, signal the caller
  /// to disconnect the client and emit a `slow_consumer` audit entry.
  pub async fn push(&self, frame: OutboundMsg) -> PushOutcome {
    let mut queue = self.inner.lock().await;
    if queue.len() < self.capacity {
      queue.push_back(frame);
      drop(queue);
      self.notify.notify_one();
      return PushOutcome::Queued;
    }

    if let Some(pos) = queue.iter().position(|f| !f.is_critical()) {
      queue.remove(pos);
      queue.push_back(frame);
      drop(queue);
      self.notify.notify_one();
      return PushOutcome::DroppedOlderNonCritical;
    }

    if !frame.is_critical() {
      // Queue is full of critical frames and this one isn't; drop the incoming frame.
      return PushOutcome::DroppedOlderNonCritical;
    }

    PushOutcome::QueueFullDisconnect
  }

  pub async fn pop(&self) -> Option<OutboundMsg> {
    loop {
      {
        let mut queue = self.inner.lock().await;
        if let Some(frame) = queue.pop_front() {
          return Some(frame);
        }
      }
      self.notify.notified().await;
    }
  }
}

/// Handle the session loop holds per connected client: enough to address
/// and authorize it without owning the socket.
pub struct ClientHandle {
  pub client_id: Uuid,
  pub user_id: Uuid,
  pub outbound: Arc<OutboundQueue>,
}

/// A fully-parsed inbound frame tagged with who sent it, handed to the
/// session loop over its bounded mpsc channel. Ordering of frames from a
/// single client is preserved because each client's read task sends into
/// the same channel in the order frames were received (§4.F/§5).
pub struct InboundEnvelope {
  pub client_id: Uuid,
  pub user_id: Uuid,
  pub message: InboundMsg,
}

/// Read task: pulls frames off the socket, decodes them, and forwards
/// them to the session loop. Malformed JSON becomes a unicast `error`
/// frame rather than closing the connection.
///
/// Generic over the underlying IO so the same task serves both a plain
/// `TcpStream` and a `hyper::upgrade::Upgraded` connection wrapped for
/// tokio (the `no_tls_upgrade` deployment mode, where TLS is terminated
/// upstream of this process).
pub async fn run_read_task<S>(
  client_id: Uuid,
  user_id: Uuid,
  mut read_half: futures_util::stream::SplitStream<WebSocketStream<S>>,
  to_session: mpsc::Sender<InboundEnvelope>,
  outbound: Arc<OutboundQueue>,
) where
  S: AsyncRead + AsyncWrite + Unpin,
{
  while let Some(next) = read_half.next().await {
    match next {
      Ok(Message::Text(text)) => match serde_json::from_str::<InboundMsg>(&text) {
        Ok(message) => {
          if to_session.send(InboundEnvelope { client_id, user_id, message }).await.is_err() {
            debug!("(transport) session loop gone, stopping read task for {client_id}");
            break;
          }
        }
        Err(e) => {
          warn!("(transport) malformed frame from {client_id}: {e}");
          outbound
            .push(OutboundMsg::Error(crate::error::AppError::validation("malformed frame").to_wire()))
            .await;
        }
      },
      Ok(Message::Close(_)) => {
        debug!("(transport) client {client_id} closed the connection");
        break;
      }
      Ok(_) => {}
      Err(e) => {
        error!("(transport) read error for {client_id}: {e}");
        break;
      }
    }
  }
}

/// Write task: drains the client's outbound queue and writes each frame
/// to the socket, preserving the order the session loop produced them in.
pub async fn run_write_task<S>(
  client_id: Uuid,
  mut write_half: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
  outbound: Arc<OutboundQueue>,
) where
  S: AsyncRead + AsyncWrite + Unpin,
{
  while let Some(frame) = outbound.pop().await {
    let text = match serde_json::to_string(&frame) {
      Ok(t) => t,
      Err(e) => {
        error!("(transport) failed to serialize outbound frame for {client_id}: {e}");
        continue;
      }
    };
    if let Err(e) = write_half.send(Message::Text(text.into())).await {
      warn!("(transport) write failed for {client_id}, closing: {e}");
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::payloads::{EntityMovedMsg, PlayerKickedMsg};
  use uuid::Uuid;

  fn moved() -> OutboundMsg {
    OutboundMsg::EntityMoved(EntityMovedMsg { table_id: Uuid::nil(), entity_id: 1, position: crate::entity::GridPos { x: 0, y: 0 } })
  }

  fn kicked() -> OutboundMsg {
    OutboundMsg::PlayerKicked(PlayerKickedMsg { user_id: Uuid::nil() })
  }

  #[test_log::test(tokio::test)]
  async fn full_queue_drops_oldest_non_critical_frame() {
    let queue = OutboundQueue::new(2);
    assert_eq!(queue.push(moved()).await, PushOutcome::Queued);
    assert_eq!(queue.push(moved()).await, PushOutcome::Queued);
    // queue full of two non-critical frames; pushing a critical one evicts the oldest.
    assert_eq!(queue.push(kicked()).await, PushOutcome::DroppedOlderNonCritical);
    assert_eq!(queue.pop().await.map(|f| f.is_critical()), Some(false));
    assert_eq!(queue.pop().await.map(|f| f.is_critical()), Some(true));
  }

  #[test_log::test(tokio::test)]
  async fn queue_full_of_critical_frames_signals_disconnect() {
    let queue = OutboundQueue::new(1);
    assert_eq!(queue.push(kicked()).await, PushOutcome::Queued);
    assert_eq!(queue.push(kicked()).await, PushOutcome::QueueFullDisconnect);
  }

  #[test_log::test(tokio::test)]
  async fn non_critical_frame_is_dropped_when_queue_full_of_critical() {
    let queue = OutboundQueue::new(1);
    assert_eq!(queue.push(kicked()).await, PushOutcome::Queued);
    assert_eq!(queue.push(moved()).await, PushOutcome::DroppedOlderNonCritical);
    assert_eq!(queue.pop().await.map(|f| f.is_critical()), Some(true));
  }
}
