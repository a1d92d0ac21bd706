//! Driver-wide registry of requests waiting for their response.
//!
//! A request is keyed by the connection it was sent on and the stream id of its frame.
//! An entry leaves the map exactly once: when its response arrives, when its
//! connection fails, or when the periodic sweep finds it older than the deadline.

use bytes::Bytes;
use cassandra_cql::frame::response::ResponseOpcode;
use cassandra_cql::frame::FrameParams;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::errors::{ConnectionError, FutureMapError};

/// Identity of a connection, unique within one [`FutureMap`].
pub(crate) type ConnectionId = u64;

/// Highest stream id usable by requests. Negative ids are reserved for server events.
const MAX_STREAM_ID: i8 = i8::MAX;
const STREAM_ID_COUNT: u32 = MAX_STREAM_ID as u32 + 1;

/// A response frame as read from the socket, before its body is parsed.
#[derive(Debug)]
pub(crate) struct TaskResponse {
    pub(crate) params: FrameParams,
    pub(crate) opcode: ResponseOpcode,
    pub(crate) body: Bytes,
}

pub(crate) type ResponseReceiver = oneshot::Receiver<Result<TaskResponse, FutureMapError>>;

struct PendingRequest {
    response_sender: oneshot::Sender<Result<TaskResponse, FutureMapError>>,
    created_at: Instant,
}

/// Requests in flight on all connections of a cluster.
pub struct FutureMap {
    pending: DashMap<(ConnectionId, i8), PendingRequest>,
    stream_id_counter: AtomicU32,
    connection_id_counter: AtomicU64,
    deadline: Duration,
}

impl std::fmt::Debug for FutureMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureMap")
            .field("pending", &self.pending.len())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl FutureMap {
    /// Creates an empty map; requests older than `deadline` are failed by [`FutureMap::sweep`].
    pub fn new(deadline: Duration) -> Self {
        FutureMap {
            pending: DashMap::new(),
            stream_id_counter: AtomicU32::new(0),
            connection_id_counter: AtomicU64::new(0),
            deadline,
        }
    }

    /// Time after which a pending request is failed with a timeout.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Number of requests waiting for a response.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is waiting for a response.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.connection_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves a free stream id on the connection and registers a pending request under it.
    ///
    /// The search starts at a shared counter masked to `0..=127` and walks every id
    /// once from there. Ids in use are skipped; the allocation fails only if all
    /// 128 ids of the connection are taken. Concurrent allocations on other
    /// connections do not shorten the walk.
    pub(crate) fn allocate(
        &self,
        connection: ConnectionId,
    ) -> Result<(i8, ResponseReceiver), FutureMapError> {
        let (response_sender, receiver) = oneshot::channel();
        let mut request = Some(PendingRequest {
            response_sender,
            created_at: Instant::now(),
        });

        let start = self.stream_id_counter.fetch_add(1, Ordering::Relaxed);
        for offset in 0..STREAM_ID_COUNT {
            let stream_id = (start.wrapping_add(offset) & MAX_STREAM_ID as u32) as i8;
            if let Entry::Vacant(entry) = self.pending.entry((connection, stream_id)) {
                if let Some(request) = request.take() {
                    entry.insert(request);
                }
                trace!(connection, stream_id, "Allocated stream id");
                return Ok((stream_id, receiver));
            }
        }

        error!(connection, "Could not allocate stream id");
        Err(FutureMapError::UnableToAllocStreamId)
    }

    /// Delivers a response to the request waiting on the stream.
    /// Returns `false` if nothing waits there, e.g. because the request was already swept.
    pub(crate) fn complete(
        &self,
        connection: ConnectionId,
        stream_id: i8,
        response: TaskResponse,
    ) -> bool {
        match self.pending.remove(&(connection, stream_id)) {
            Some((_, request)) => {
                // The receiver may be gone if the caller stopped waiting.
                let _ = request.response_sender.send(Ok(response));
                true
            }
            None => {
                debug!(
                    connection,
                    stream_id, "Received response for a stream with no pending request"
                );
                false
            }
        }
    }

    /// Frees the stream without answering the request; used when the request
    /// never made it to the socket.
    pub(crate) fn release(&self, connection: ConnectionId, stream_id: i8) {
        self.pending.remove(&(connection, stream_id));
    }

    /// Fails every request older than the deadline with a timeout.
    /// Returns the number of failed requests.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(ConnectionId, i8)> = self
            .pending
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.created_at) >= self.deadline)
            .map(|entry| *entry.key())
            .collect();

        let mut swept = 0;
        for key in expired {
            // A response may have arrived in the meantime; only remove what is still expired.
            let removed = self.pending.remove_if(&key, |_, request| {
                now.saturating_duration_since(request.created_at) >= self.deadline
            });
            if let Some((_, request)) = removed {
                let _ = request
                    .response_sender
                    .send(Err(FutureMapError::Timeout(self.deadline)));
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(swept, "Timed out pending requests");
        }
        swept
    }

    /// Fails every request of the connection with the given error.
    /// Returns the number of failed requests.
    pub(crate) fn fail_connection(&self, connection: ConnectionId, error: &ConnectionError) -> usize {
        let keys: Vec<(ConnectionId, i8)> = self
            .pending
            .iter()
            .filter(|entry| entry.key().0 == connection)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for key in keys {
            if let Some((_, request)) = self.pending.remove(&key) {
                let _ = request
                    .response_sender
                    .send(Err(FutureMapError::ConnectionFailed(error.clone())));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(connection, failed, error = %error, "Failed pending requests of a connection");
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    fn response(stream: i8) -> TaskResponse {
        TaskResponse {
            params: FrameParams {
                stream,
                ..Default::default()
            },
            opcode: ResponseOpcode::Ready,
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn completes_the_matching_request() {
        setup_tracing();
        let map = FutureMap::new(Duration::from_secs(10));
        let (first, first_rx) = map.allocate(0).unwrap();
        let (second, second_rx) = map.allocate(0).unwrap();
        assert_ne!(first, second);

        assert!(map.complete(0, second, response(second)));
        assert_eq!(second_rx.await.unwrap().unwrap().params.stream, second);
        assert_eq!(map.len(), 1);

        // Same stream on another connection is a different request.
        assert!(!map.complete(1, first, response(first)));
        assert!(map.complete(0, first, response(first)));
        assert!(first_rx.await.unwrap().is_ok());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn exhausting_stream_ids_is_an_explicit_error() {
        setup_tracing();
        let map = FutureMap::new(Duration::from_secs(10));
        let mut receivers = Vec::new();
        let mut ids = HashSet::new();
        for _ in 0..128 {
            let (id, rx) = map.allocate(7).unwrap();
            assert!((0..=127).contains(&id));
            ids.insert(id);
            receivers.push(rx);
        }
        assert_eq!(ids.len(), 128);
        assert_matches!(map.allocate(7), Err(FutureMapError::UnableToAllocStreamId));

        // Other connections are not affected.
        assert!(map.allocate(8).is_ok());

        map.release(7, 42);
        assert_eq!(map.allocate(7).unwrap().0, 42);
    }

    #[test]
    fn last_free_id_is_found_under_contention() {
        setup_tracing();
        let map = FutureMap::new(Duration::from_secs(10));
        let mut receivers = Vec::new();
        for _ in 0..127 {
            receivers.push(map.allocate(1).unwrap());
        }
        let taken: HashSet<i8> = receivers.iter().map(|(id, _)| *id).collect();
        let free = (0..=MAX_STREAM_ID).find(|id| !taken.contains(id)).unwrap();

        std::thread::scope(|scope| {
            for connection in 2..8 {
                let map = &map;
                scope.spawn(move || {
                    for _ in 0..10_000 {
                        let (id, _rx) = map.allocate(connection).unwrap();
                        map.release(connection, id);
                    }
                });
            }

            for _ in 0..10_000 {
                let (id, _rx) = map.allocate(1).unwrap();
                assert_eq!(id, free);
                map.release(1, id);
            }
        });
    }

    #[tokio::test]
    async fn sweep_times_out_each_request_exactly_once() {
        setup_tracing();
        tokio::time::pause();
        let map = FutureMap::new(Duration::from_secs(10));
        let (_, old_rx) = map.allocate(0).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let (young, young_rx) = map.allocate(0).unwrap();

        assert_eq!(map.sweep(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(map.sweep(Instant::now()), 1);
        assert_eq!(map.sweep(Instant::now()), 0);
        assert_matches!(old_rx.await.unwrap(), Err(FutureMapError::Timeout(d)) if d == Duration::from_secs(10));

        // A response that arrives after the sweep finds nothing to complete.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(map.sweep(Instant::now()), 1);
        assert!(!map.complete(0, young, response(young)));
        assert_matches!(young_rx.await.unwrap(), Err(FutureMapError::Timeout(_)));
    }

    #[tokio::test]
    async fn failing_a_connection_fails_only_its_requests() {
        setup_tracing();
        let map = FutureMap::new(Duration::from_secs(10));
        let (_, a) = map.allocate(1).unwrap();
        let (_, b) = map.allocate(1).unwrap();
        let (other, c) = map.allocate(2).unwrap();

        assert_eq!(map.fail_connection(1, &ConnectionError::Closed), 2);
        assert_eq!(map.fail_connection(1, &ConnectionError::Closed), 0);
        assert_matches!(
            a.await.unwrap(),
            Err(FutureMapError::ConnectionFailed(ConnectionError::Closed))
        );
        assert_matches!(b.await.unwrap(), Err(FutureMapError::ConnectionFailed(_)));

        assert!(map.complete(2, other, response(other)));
        assert!(c.await.unwrap().is_ok());
    }
}
