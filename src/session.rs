//! The session protocol: handshake, request correlation, and the busy probe.
//!
//! A [`Session`] wraps one [`Connection`] and one [`Correlator`]. The driver
//! feeds it code via [`Session::send_code`] and pulls typed
//! [`SessionEvent`]s via [`Session::next_event`]; everything the peer sends
//! back is dispatched here, so correlation state is only ever touched from
//! the driver's single consumer loop.
//!
//! The standalone [`check`] probe answers "is the server free?" over its own
//! short-lived connection without disturbing a main session.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::correlate::Correlator;
use crate::net::{Connection, ConnectionEvent, NetError};
use crate::protocol::{Message, BUSY};

/// Results at or below this length are also echoed on the generic notice
/// channel, so short answers show up even when the origin is off-screen.
pub const INLINE_NOTICE_LIMIT: usize = 64;

/// What a session reports to its driver.
///
/// `C` is the opaque per-request context supplied to
/// [`Session::send_code`], typically "where to render the answer".
#[derive(Debug, PartialEq)]
pub enum SessionEvent<C> {
    /// A resolved eval outcome, keyed by its original context when the
    /// request was tracked.
    Result {
        contents: String,
        context: Option<C>,
        is_error: bool,
    },
    /// Generic notification channel: short results, uncorrelated results,
    /// and error reports.
    Notice { text: String, is_error: bool },
    /// The peer signalled readiness (`Affirm`).
    PeerReady,
    /// The peer is already serving another session.
    PeerBusy,
    /// The connection ended; any pending requests were already failed.
    Disconnected,
}

/// Answer from the [`check`] probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Available,
    Busy,
}

/// One exclusive conversation with the eval server.
pub struct Session<C> {
    connection: Connection,
    events: UnboundedReceiver<ConnectionEvent>,
    pending: Correlator<C>,
    queue: VecDeque<SessionEvent<C>>,
}

impl<C> Session<C> {
    /// Create an unconnected session targeting `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        let (connection, events) = Connection::new(addr);
        Self {
            connection,
            events,
            pending: Correlator::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Connect and announce the session with a `Start` message.
    ///
    /// A peer that is already serving someone else answers with
    /// `Failure`/`"BUSY"`, which arrives later as
    /// [`SessionEvent::PeerBusy`].
    ///
    /// # Errors
    ///
    /// Transport failures from the connect or the handshake send.
    pub async fn start(&mut self) -> Result<(), NetError> {
        self.connection.connect().await?;
        self.connection.send(&Message::Start).await
    }

    /// [`Session::start`] with exponential backoff between attempts.
    ///
    /// Useful when the server may still be coming up. Retries with delays
    /// of 100ms, 200ms, 400ms, etc.
    ///
    /// # Errors
    ///
    /// The last error if every attempt fails.
    pub async fn start_with_retry(&mut self, max_attempts: u32) -> Result<(), NetError> {
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.start().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_attempts {
                        let delay = Duration::from_millis(100 * (1 << (attempt - 1)));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.expect("max_attempts must be > 0"))
    }

    /// Ship one piece of code for evaluation.
    ///
    /// Allocates a request id, tracks `context` under it when supplied, and
    /// sends the request envelope. Returns the id so the driver can relate
    /// later events to this call.
    ///
    /// # Errors
    ///
    /// `NetError::NotConnected` when the session is down, plus any
    /// encode/write failure. On failure the tracked entry is removed
    /// immediately so it cannot leak, and if the send tore the connection
    /// down, the remaining pending requests are failed as well.
    pub async fn send_code(
        &mut self,
        code: impl Into<String>,
        context: Option<C>,
    ) -> Result<u64, NetError> {
        let id = self.pending.next_id();
        if let Some(context) = context {
            self.pending
                .track(id, context)
                .map_err(|e| NetError::Protocol(e.to_string()))?;
        }

        let request = Message::Success {
            request_id: Some(id),
            contents: code.into(),
        };
        let was_connected = self.connection.is_connected();
        if let Err(e) = self.connection.send(&request).await {
            // the reply can never arrive; reclaim the slot before reporting
            self.pending.resolve(id);
            if was_connected && !self.connection.is_connected() {
                // the write tore the link down, flush everyone else too
                self.fail_pending();
                self.queue.push_back(SessionEvent::Disconnected);
            }
            return Err(e);
        }

        debug!(id, "request sent");
        Ok(id)
    }

    /// Wait for the next session event.
    ///
    /// Events are delivered in the order the peer's frames arrived. Cancel
    /// safe: a cancelled call loses nothing.
    pub async fn next_event(&mut self) -> Option<SessionEvent<C>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            let event = self.events.recv().await?;
            self.apply(event);
        }
    }

    /// Pop an already-queued event without waiting.
    ///
    /// After [`Session::disconnect`] this drains the failure events for any
    /// requests that were still pending.
    pub fn take_event(&mut self) -> Option<SessionEvent<C>> {
        self.queue.pop_front()
    }

    /// Tear the session down.
    ///
    /// Idempotent. When the session was connected, every pending request is
    /// resolved with a transport failure exactly once and a final
    /// [`SessionEvent::Disconnected`] is queued.
    pub fn disconnect(&mut self) {
        if self.connection.disconnect() {
            self.fail_pending();
            self.queue.push_back(SessionEvent::Disconnected);
        }
    }

    fn apply(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(message) => self.on_message(message),
            ConnectionEvent::Error(e) => {
                warn!("connection error: {e}");
                self.queue.push_back(SessionEvent::Notice {
                    text: e.to_string(),
                    is_error: true,
                });
            }
            ConnectionEvent::Closed => self.disconnect(),
        }
    }

    /// Dispatch one inbound message by status.
    fn on_message(&mut self, message: Message) {
        match message {
            Message::Success {
                request_id,
                contents,
            } => {
                match request_id.and_then(|id| self.pending.resolve(id)) {
                    Some(context) => {
                        let echo = (contents.len() <= INLINE_NOTICE_LIMIT)
                            .then(|| contents.clone());
                        self.queue.push_back(SessionEvent::Result {
                            contents,
                            context: Some(context),
                            is_error: false,
                        });
                        if let Some(text) = echo {
                            self.queue.push_back(SessionEvent::Notice {
                                text,
                                is_error: false,
                            });
                        }
                    }
                    None => {
                        debug!(?request_id, "result without a pending request");
                        self.queue.push_back(SessionEvent::Notice {
                            text: contents,
                            is_error: false,
                        });
                    }
                }
            }
            Message::Failure {
                request_id,
                contents,
            } => {
                if request_id.is_none() && contents == BUSY {
                    self.queue.push_back(SessionEvent::PeerBusy);
                    return;
                }
                if let Some(context) = request_id.and_then(|id| self.pending.resolve(id)) {
                    self.queue.push_back(SessionEvent::Result {
                        contents: contents.clone(),
                        context: Some(context),
                        is_error: true,
                    });
                }
                // failures are surfaced even when no request matched
                self.queue.push_back(SessionEvent::Notice {
                    text: contents,
                    is_error: true,
                });
            }
            Message::Affirm => self.queue.push_back(SessionEvent::PeerReady),
            Message::Start | Message::Check => {
                warn!("unexpected handshake message from peer, dropped");
            }
            Message::Unknown => debug!("ignoring message with unknown status"),
        }
    }

    /// Resolve every pending request with a synthetic transport failure.
    fn fail_pending(&mut self) {
        for (id, context) in self.pending.drain() {
            debug!(id, "failing pending request after disconnect");
            self.queue.push_back(SessionEvent::Result {
                contents: NetError::ConnectionClosed.to_string(),
                context: Some(context),
                is_error: true,
            });
        }
    }
}

/// Probe whether the server is reachable and free.
///
/// Opens a separate short-lived connection, sends `Check`, and waits for
/// `Affirm` (available) or `Failure`/`"BUSY"` (occupied). The auxiliary
/// connection is always closed once a definitive answer (or a connection
/// error) arrives, and a concurrent main session is never disturbed. No
/// timeout is applied here; callers own one.
///
/// # Errors
///
/// Transport failures, or `NetError::Protocol` when the peer answers with
/// something other than the two expected verdicts.
pub async fn check(addr: &str) -> Result<PeerStatus, NetError> {
    let (mut connection, mut events) = Connection::new(addr);
    connection.connect().await?;
    let verdict = await_verdict(&mut connection, &mut events).await;
    connection.disconnect();
    verdict
}

async fn await_verdict(
    connection: &mut Connection,
    events: &mut UnboundedReceiver<ConnectionEvent>,
) -> Result<PeerStatus, NetError> {
    connection.send(&Message::Check).await?;

    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(Message::Affirm) => return Ok(PeerStatus::Available),
            ConnectionEvent::Message(Message::Failure { contents, .. }) => {
                return if contents == BUSY {
                    Ok(PeerStatus::Busy)
                } else {
                    Err(NetError::Protocol(format!(
                        "unexpected failure from peer: {contents}"
                    )))
                };
            }
            ConnectionEvent::Message(other) => {
                debug!(?other, "ignoring message while probing");
            }
            ConnectionEvent::Error(e) => return Err(e),
            ConnectionEvent::Closed => return Err(NetError::ConnectionClosed),
        }
    }
    Err(NetError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session() -> Session<&'static str> {
        Session::new("127.0.0.1:0")
    }

    fn tracked(session: &mut Session<&'static str>, context: &'static str) -> u64 {
        let id = session.pending.next_id();
        session.pending.track(id, context).unwrap();
        id
    }

    #[test]
    fn success_resolves_the_tracked_context() {
        let mut session = session();
        let id = tracked(&mut session, "buffer 1, line 3");

        session.on_message(Message::Success {
            request_id: Some(id),
            contents: "2".to_string(),
        });

        assert_eq!(
            session.take_event(),
            Some(SessionEvent::Result {
                contents: "2".to_string(),
                context: Some("buffer 1, line 3"),
                is_error: false,
            })
        );
        assert_eq!(session.pending_requests(), 0);
    }

    #[test]
    fn short_results_are_echoed_as_a_notice() {
        let mut session = session();
        let id = tracked(&mut session, "ctx");

        session.on_message(Message::Success {
            request_id: Some(id),
            contents: "2".to_string(),
        });

        assert!(matches!(
            session.take_event(),
            Some(SessionEvent::Result { .. })
        ));
        assert_eq!(
            session.take_event(),
            Some(SessionEvent::Notice {
                text: "2".to_string(),
                is_error: false,
            })
        );
    }

    #[test]
    fn long_results_are_not_echoed() {
        let mut session = session();
        let id = tracked(&mut session, "ctx");

        let long = "x".repeat(INLINE_NOTICE_LIMIT + 1);
        session.on_message(Message::Success {
            request_id: Some(id),
            contents: long,
        });

        assert!(matches!(
            session.take_event(),
            Some(SessionEvent::Result { .. })
        ));
        assert_eq!(session.take_event(), None);
    }

    #[test]
    fn uncorrelated_success_becomes_a_notice() {
        let mut session = session();

        session.on_message(Message::Success {
            request_id: Some(99),
            contents: "orphan".to_string(),
        });

        assert_eq!(
            session.take_event(),
            Some(SessionEvent::Notice {
                text: "orphan".to_string(),
                is_error: false,
            })
        );
        assert_eq!(session.take_event(), None);
    }

    #[test]
    fn failure_notifies_even_without_a_pending_request() {
        let mut session = session();

        session.on_message(Message::Failure {
            request_id: Some(42),
            contents: "NameError".to_string(),
        });

        assert_eq!(
            session.take_event(),
            Some(SessionEvent::Notice {
                text: "NameError".to_string(),
                is_error: true,
            })
        );
    }

    #[test]
    fn correlated_failure_reaches_context_and_notice() {
        let mut session = session();
        let id = tracked(&mut session, "ctx");

        session.on_message(Message::Failure {
            request_id: Some(id),
            contents: "SyntaxError".to_string(),
        });

        assert_eq!(
            session.take_event(),
            Some(SessionEvent::Result {
                contents: "SyntaxError".to_string(),
                context: Some("ctx"),
                is_error: true,
            })
        );
        assert_eq!(
            session.take_event(),
            Some(SessionEvent::Notice {
                text: "SyntaxError".to_string(),
                is_error: true,
            })
        );
    }

    #[test]
    fn uncorrelated_busy_failure_is_distinguished() {
        let mut session = session();

        session.on_message(Message::Failure {
            request_id: None,
            contents: BUSY.to_string(),
        });

        assert_eq!(session.take_event(), Some(SessionEvent::PeerBusy));
        assert_eq!(session.take_event(), None);
    }

    #[test]
    fn affirm_signals_readiness() {
        let mut session = session();
        session.on_message(Message::Affirm);
        assert_eq!(session.take_event(), Some(SessionEvent::PeerReady));
    }

    #[test]
    fn unknown_and_handshake_tags_are_dropped() {
        let mut session = session();
        session.on_message(Message::Unknown);
        session.on_message(Message::Start);
        session.on_message(Message::Check);
        assert_eq!(session.take_event(), None);
    }

    #[test]
    fn fail_pending_resolves_each_context_exactly_once() {
        let mut session = session();
        tracked(&mut session, "three");
        tracked(&mut session, "four");

        session.fail_pending();

        let mut failed = Vec::new();
        while let Some(event) = session.take_event() {
            match event {
                SessionEvent::Result {
                    context: Some(context),
                    is_error: true,
                    ..
                } => failed.push(context),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        failed.sort_unstable();
        assert_eq!(failed, vec!["four", "three"]);
        assert_eq!(session.pending_requests(), 0);
    }
}
