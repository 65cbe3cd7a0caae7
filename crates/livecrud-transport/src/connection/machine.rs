//! Pure reconnect state machine.
//!
//! Each event moves the machine to a new state and returns the effects the
//! driver must carry out. Transports and retry timers are named by ids, so
//! events from a superseded transport or a cancelled timer are inert.

use std::time::Duration;

use livecrud_core::ReconnectPolicy;

/// Identifier of one transport attempt.
pub type ConnId = u64;
/// Identifier of one scheduled retry.
pub type TimerId = u64;

/// Lifecycle of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No consumer, no transport.
    Idle,
    /// Transport requested, not yet ready.
    Connecting,
    /// Transport ready; notifications flowing.
    Open,
    /// Closing the transport at this client's request.
    Closing,
    /// Waiting `delay` before attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Gave up after the configured number of attempts.
    Failed,
}

/// Input to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Whether anyone consumes the data.
    Demand(bool),
    TransportOpened { conn: ConnId },
    /// The transport closed without this client asking it to.
    TransportClosed { conn: ConnId, was_clean: bool },
    TransportError { conn: ConnId, message: String },
    RetryElapsed { timer: TimerId },
    /// Retry now, cancelling any pending retry.
    ManualReconnect,
    /// The consumer went away; close everything.
    Teardown,
}

/// Work the driver must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { conn: ConnId },
    CloseTransport { conn: ConnId },
    ScheduleRetry { timer: TimerId, delay: Duration },
    CancelRetry { timer: TimerId },
}

/// The connection state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    max_attempts: Option<u32>,
    state: ConnectionState,
    demand: bool,
    attempt: u32,
    live: Option<ConnId>,
    closing: Option<ConnId>,
    pending_timer: Option<TimerId>,
    next_conn: ConnId,
    next_timer: TimerId,
}

impl ConnectionMachine {
    /// Retry forever according to `policy`.
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            max_attempts: None,
            state: ConnectionState::Idle,
            demand: false,
            attempt: 0,
            live: None,
            closing: None,
            pending_timer: None,
            next_conn: 0,
            next_timer: 0,
        }
    }

    /// Stop retrying (state `Failed`) after `max` consecutive failures.
    #[must_use]
    pub const fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transport currently considered live, if any.
    #[must_use]
    pub const fn live_transport(&self) -> Option<ConnId> {
        self.live
    }

    /// Retry timer currently scheduled, if any.
    #[must_use]
    pub const fn pending_timer(&self) -> Option<TimerId> {
        self.pending_timer
    }

    /// Apply one event.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            ConnectionEvent::Demand(true) => {
                self.demand = true;
                if matches!(
                    self.state,
                    ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Failed
                ) {
                    self.attempt = 0;
                    self.open(&mut effects);
                }
            }
            ConnectionEvent::Demand(false) | ConnectionEvent::Teardown => {
                self.demand = false;
                self.attempt = 0;
                self.cancel_retry(&mut effects);
                if let Some(conn) = self.live.take() {
                    effects.push(Effect::CloseTransport { conn });
                    self.closing = Some(conn);
                    self.state = ConnectionState::Closing;
                } else if self.state != ConnectionState::Closing {
                    self.state = ConnectionState::Idle;
                }
            }
            ConnectionEvent::TransportOpened { conn } => {
                if self.live == Some(conn) && self.state == ConnectionState::Connecting {
                    self.attempt = 0;
                    self.state = ConnectionState::Open;
                }
            }
            ConnectionEvent::TransportClosed { conn, .. }
            | ConnectionEvent::TransportError { conn, .. } => {
                if self.closing == Some(conn) {
                    self.closing = None;
                    if self.state == ConnectionState::Closing {
                        self.state = ConnectionState::Idle;
                    }
                } else if self.live == Some(conn) {
                    self.live = None;
                    self.lost(&mut effects);
                }
            }
            ConnectionEvent::RetryElapsed { timer } => {
                if self.pending_timer == Some(timer) {
                    self.pending_timer = None;
                    if self.demand {
                        self.open(&mut effects);
                    } else {
                        self.state = ConnectionState::Idle;
                    }
                }
            }
            ConnectionEvent::ManualReconnect => {
                if self.demand {
                    self.cancel_retry(&mut effects);
                    if let Some(conn) = self.live.take() {
                        effects.push(Effect::CloseTransport { conn });
                        self.closing = Some(conn);
                    }
                    self.attempt = 0;
                    self.open(&mut effects);
                }
            }
        }
        effects
    }

    fn open(&mut self, effects: &mut Vec<Effect>) {
        self.next_conn += 1;
        let conn = self.next_conn;
        self.live = Some(conn);
        self.state = ConnectionState::Connecting;
        effects.push(Effect::OpenTransport { conn });
    }

    fn lost(&mut self, effects: &mut Vec<Effect>) {
        self.attempt = self.attempt.saturating_add(1);
        if self.max_attempts.is_some_and(|max| self.attempt > max) {
            self.state = ConnectionState::Failed;
            return;
        }
        // Never two timers alive at once.
        self.cancel_retry(effects);

        let delay = self.policy.delay_for(self.attempt);
        self.next_timer += 1;
        let timer = self.next_timer;
        self.pending_timer = Some(timer);
        self.state = ConnectionState::Reconnecting {
            attempt: self.attempt,
            delay,
        };
        effects.push(Effect::ScheduleRetry { timer, delay });
    }

    fn cancel_retry(&mut self, effects: &mut Vec<Effect>) {
        if let Some(timer) = self.pending_timer.take() {
            effects.push(Effect::CancelRetry { timer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE: Duration = Duration::from_secs(5);

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy::Fixed { delay: FIVE })
    }

    /// Demand and open the first transport.
    fn opened(m: &mut ConnectionMachine) -> ConnId {
        assert_eq!(
            m.handle(ConnectionEvent::Demand(true)),
            vec![Effect::OpenTransport { conn: 1 }]
        );
        m.handle(ConnectionEvent::TransportOpened { conn: 1 });
        assert_eq!(m.state(), ConnectionState::Open);
        1
    }

    #[test]
    fn test_no_connection_without_demand() {
        let mut m = machine();
        assert!(m.handle(ConnectionEvent::ManualReconnect).is_empty());
        assert!(m.handle(ConnectionEvent::Teardown).is_empty());
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_unclean_close_schedules_one_retry() {
        let mut m = machine();
        let conn = opened(&mut m);

        let effects = m.handle(ConnectionEvent::TransportClosed {
            conn,
            was_clean: false,
        });
        assert_eq!(effects, vec![Effect::ScheduleRetry { timer: 1, delay: FIVE }]);
        assert_eq!(
            m.state(),
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: FIVE
            }
        );

        // The error that follows a close for the same transport is stale.
        assert!(
            m.handle(ConnectionEvent::TransportError {
                conn,
                message: "reset".to_string()
            })
            .is_empty()
        );

        assert_eq!(
            m.handle(ConnectionEvent::RetryElapsed { timer: 1 }),
            vec![Effect::OpenTransport { conn: 2 }]
        );
        assert_eq!(m.state(), ConnectionState::Connecting);

        m.handle(ConnectionEvent::TransportError {
            conn: 2,
            message: "refused".to_string(),
        });
        assert_eq!(
            m.state(),
            ConnectionState::Reconnecting {
                attempt: 2,
                delay: FIVE
            }
        );
        assert_eq!(m.pending_timer(), Some(2));
    }

    #[test]
    fn test_server_close_frame_still_reconnects() {
        let mut m = machine();
        let conn = opened(&mut m);
        m.handle(ConnectionEvent::TransportClosed {
            conn,
            was_clean: true,
        });
        assert!(matches!(m.state(), ConnectionState::Reconnecting { attempt: 1, .. }));
    }

    #[test]
    fn test_teardown_cancels_pending_retry() {
        let mut m = machine();
        let conn = opened(&mut m);
        m.handle(ConnectionEvent::TransportClosed {
            conn,
            was_clean: false,
        });

        assert_eq!(
            m.handle(ConnectionEvent::Teardown),
            vec![Effect::CancelRetry { timer: 1 }]
        );
        assert_eq!(m.state(), ConnectionState::Idle);
        // A timer that fires anyway does nothing.
        assert!(m.handle(ConnectionEvent::RetryElapsed { timer: 1 }).is_empty());
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_teardown_closes_live_transport() {
        let mut m = machine();
        let conn = opened(&mut m);

        assert_eq!(
            m.handle(ConnectionEvent::Teardown),
            vec![Effect::CloseTransport { conn }]
        );
        assert_eq!(m.state(), ConnectionState::Closing);
        assert!(
            m.handle(ConnectionEvent::TransportClosed {
                conn,
                was_clean: true
            })
            .is_empty()
        );
        assert_eq!(m.state(), ConnectionState::Idle);
        assert_eq!(m.live_transport(), None);
    }

    #[test]
    fn test_manual_reconnect_supersedes_timer_and_transport() {
        let mut m = machine();
        let conn = opened(&mut m);
        m.handle(ConnectionEvent::TransportClosed {
            conn,
            was_clean: false,
        });

        assert_eq!(
            m.handle(ConnectionEvent::ManualReconnect),
            vec![
                Effect::CancelRetry { timer: 1 },
                Effect::OpenTransport { conn: 2 }
            ]
        );
        assert_eq!(m.state(), ConnectionState::Connecting);

        assert_eq!(
            m.handle(ConnectionEvent::ManualReconnect),
            vec![
                Effect::CloseTransport { conn: 2 },
                Effect::OpenTransport { conn: 3 }
            ]
        );
        // Superseded transport reports in late; nothing happens.
        assert!(
            m.handle(ConnectionEvent::TransportOpened { conn: 2 })
                .is_empty()
        );
        assert_eq!(m.state(), ConnectionState::Connecting);
        m.handle(ConnectionEvent::TransportOpened { conn: 3 });
        assert_eq!(m.state(), ConnectionState::Open);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut m = machine().with_max_attempts(1);
        let conn = opened(&mut m);
        m.handle(ConnectionEvent::TransportClosed {
            conn,
            was_clean: false,
        });
        m.handle(ConnectionEvent::RetryElapsed { timer: 1 });
        let effects = m.handle(ConnectionEvent::TransportClosed {
            conn: 2,
            was_clean: false,
        });
        assert!(effects.is_empty());
        assert_eq!(m.state(), ConnectionState::Failed);

        assert_eq!(
            m.handle(ConnectionEvent::ManualReconnect),
            vec![Effect::OpenTransport { conn: 3 }]
        );
    }

    #[test]
    fn test_demand_leaves_failed_state() {
        let mut m = machine().with_max_attempts(0);
        let conn = opened(&mut m);
        m.handle(ConnectionEvent::TransportError {
            conn,
            message: "reset".into(),
        });
        assert_eq!(m.state(), ConnectionState::Failed);

        assert_eq!(
            m.handle(ConnectionEvent::Demand(true)),
            vec![Effect::OpenTransport { conn: 2 }]
        );
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let mut m = ConnectionMachine::new(ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(3),
        });
        m.handle(ConnectionEvent::Demand(true));
        let mut delays = Vec::new();
        for conn in 1..=4 {
            m.handle(ConnectionEvent::TransportError {
                conn,
                message: "refused".to_string(),
            });
            if let ConnectionState::Reconnecting { delay, .. } = m.state() {
                delays.push(delay.as_secs());
            }
            let timer = m.pending_timer().unwrap();
            m.handle(ConnectionEvent::RetryElapsed { timer });
        }
        assert_eq!(delays, vec![1, 2, 3, 3]);
    }

    #[test]
    fn test_open_resets_attempts() {
        let mut m = machine();
        let conn = opened(&mut m);
        m.handle(ConnectionEvent::TransportClosed {
            conn,
            was_clean: false,
        });
        m.handle(ConnectionEvent::RetryElapsed { timer: 1 });
        m.handle(ConnectionEvent::TransportOpened { conn: 2 });
        m.handle(ConnectionEvent::TransportClosed {
            conn: 2,
            was_clean: false,
        });
        assert!(matches!(m.state(), ConnectionState::Reconnecting { attempt: 1, .. }));
    }
}
