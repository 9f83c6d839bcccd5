//! Channel state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The channel actor executes the I/O implied by each action and feeds the
//! outcome back in as the next event.

use std::time::Duration;

use tracing::debug;
use transport::is_server_disconnect;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Label for health output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Internal state, carrying what each transition needs.
///
/// Transitions:
/// - Disconnected/Failed → Connecting (connect requested)
/// - Connecting/Reconnecting → Connected (link opened, subscriptions re-armed)
/// - Connecting → Reconnecting (first open failed)
/// - Connected → Reconnecting (link lost for a retryable reason)
/// - Reconnecting → Failed (attempt budget exhausted)
/// - Connected → Disconnected (server-initiated disconnect)
/// - any → Refreshing (credential rejected) → Reauthorizing | Disconnected
/// - Reauthorizing → Connected | Disconnected (rejected again)
/// - any → Disconnected (disconnect requested, credential cleared)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out (or executing) reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Driving a credential refresh after an auth rejection
    Refreshing,
    /// Opening with the refreshed credential; one refresh per connect cycle
    Reauthorizing,
    Failed,
}

impl ChannelState {
    pub fn public(&self) -> ConnectionState {
        match self {
            ChannelState::Disconnected => ConnectionState::Disconnected,
            ChannelState::Connecting | ChannelState::Refreshing | ChannelState::Reauthorizing => {
                ConnectionState::Connecting
            }
            ChannelState::Connected => ConnectionState::Connected,
            ChannelState::Reconnecting { .. } => ConnectionState::Reconnecting,
            ChannelState::Failed => ConnectionState::Failed,
        }
    }
}

/// Reconnect schedule: `min(max_delay, base_delay * 2^(attempt-1))`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before `Failed`
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(32000),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Lifecycle notices broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    Connected,
    Disconnected { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectFailed,
    AuthFailed { reason: String },
    Reauthenticated,
    LoggedOut,
}

/// Events that drive state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// `connect()` called
    ConnectRequested,
    /// Link opened and handshake accepted
    Opened,
    /// Open failed for a reason other than credential rejection
    OpenFailed { reason: String },
    /// Live link closed
    Closed { reason: String },
    /// Live link failed
    TransportError { message: String },
    /// Handshake or live connection refused the credential
    AuthRejected { reason: String },
    /// Server accepted an `auth` frame on the live link
    AuthAccepted,
    /// Coordinated refresh produced a new credential
    AuthRefreshed,
    /// Coordinated refresh failed
    AuthRefreshFailed { reason: String },
    /// Backoff delay elapsed
    RetryTimer,
    /// `disconnect()` called
    DisconnectRequested,
    /// The stored credential was rotated by someone else
    TokenRotated,
    /// The stored credential was cleared (logout, session expiry)
    CredentialCleared,
}

/// Actions the actor executes after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Open a new link with the current credential
    Open,
    /// Re-arm every subscription on the new link, then announce `Connected`
    Activate,
    /// Drop the link (if any) and arm the backoff timer
    ScheduleReconnect {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// Drop the link (if any); the attempt budget is spent
    GiveUp { reason: String },
    /// Drop the link (if any), cancel timers, announce `notice`
    Release { notice: ChannelNotice },
    /// Drop the link (if any) and run the coordinated refresh
    RefreshCredential { reason: String },
    /// Send the rotated credential on the live link
    Reauthenticate,
    /// Announce without changing resources
    Notify(ChannelNotice),
    /// No-op
    None,
}

/// Reason recorded when the client itself disconnects.
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: ChannelState,
    event: ChannelEvent,
    policy: &BackoffPolicy,
) -> (ChannelState, ChannelAction) {
    match (state, event) {
        // --- Explicit disconnect wins everywhere ---
        (ChannelState::Disconnected, ChannelEvent::DisconnectRequested) => {
            (ChannelState::Disconnected, ChannelAction::None)
        }
        (_, ChannelEvent::DisconnectRequested) => (
            ChannelState::Disconnected,
            ChannelAction::Release {
                notice: ChannelNotice::Disconnected {
                    reason: CLIENT_DISCONNECT_REASON.to_string(),
                },
            },
        ),

        // --- Connect ---
        (ChannelState::Disconnected | ChannelState::Failed, ChannelEvent::ConnectRequested) => {
            (ChannelState::Connecting, ChannelAction::Open)
        }
        (state, ChannelEvent::ConnectRequested) => (state, ChannelAction::None),

        // --- Open outcomes ---
        (
            ChannelState::Connecting | ChannelState::Reconnecting { .. } | ChannelState::Reauthorizing,
            ChannelEvent::Opened,
        ) => (ChannelState::Connected, ChannelAction::Activate),

        (
            ChannelState::Connecting | ChannelState::Reauthorizing,
            ChannelEvent::OpenFailed { reason },
        ) => {
            schedule(1, reason, policy)
        }
        (ChannelState::Reconnecting { attempt }, ChannelEvent::OpenFailed { reason }) => {
            schedule(attempt + 1, reason, policy)
        }

        (ChannelState::Reconnecting { attempt }, ChannelEvent::RetryTimer) => {
            (ChannelState::Reconnecting { attempt }, ChannelAction::Open)
        }

        // --- Live link lost ---
        (ChannelState::Connected, ChannelEvent::Closed { reason })
            if is_server_disconnect(&reason) =>
        {
            (
                ChannelState::Disconnected,
                ChannelAction::Release {
                    notice: ChannelNotice::Disconnected { reason },
                },
            )
        }
        (ChannelState::Connected, ChannelEvent::Closed { reason }) => schedule(1, reason, policy),
        (ChannelState::Connected, ChannelEvent::TransportError { message }) => {
            schedule(1, message, policy)
        }

        // --- Credential rejection and refresh ---
        // A fresh credential that is still refused will not get better
        (ChannelState::Reauthorizing, ChannelEvent::AuthRejected { reason }) => (
            ChannelState::Disconnected,
            ChannelAction::Release {
                notice: ChannelNotice::AuthFailed { reason },
            },
        ),
        (
            ChannelState::Connecting | ChannelState::Connected | ChannelState::Reconnecting { .. },
            ChannelEvent::AuthRejected { reason },
        ) => (
            ChannelState::Refreshing,
            ChannelAction::RefreshCredential { reason },
        ),
        (ChannelState::Refreshing, ChannelEvent::AuthRefreshed) => {
            (ChannelState::Reauthorizing, ChannelAction::Open)
        }
        (ChannelState::Refreshing, ChannelEvent::AuthRefreshFailed { reason }) => (
            ChannelState::Disconnected,
            ChannelAction::Release {
                notice: ChannelNotice::AuthFailed { reason },
            },
        ),

        // --- Credential observation ---
        (ChannelState::Connected, ChannelEvent::TokenRotated) => {
            (ChannelState::Connected, ChannelAction::Reauthenticate)
        }
        (ChannelState::Connected, ChannelEvent::AuthAccepted) => (
            ChannelState::Connected,
            ChannelAction::Notify(ChannelNotice::Reauthenticated),
        ),
        // A failed refresh clears the store before it reports; let the
        // refresh outcome decide the notice
        (ChannelState::Refreshing, ChannelEvent::CredentialCleared) => {
            (ChannelState::Refreshing, ChannelAction::None)
        }
        (
            ChannelState::Connecting
            | ChannelState::Connected
            | ChannelState::Reconnecting { .. }
            | ChannelState::Reauthorizing,
            ChannelEvent::CredentialCleared,
        ) => (
            ChannelState::Disconnected,
            ChannelAction::Release {
                notice: ChannelNotice::LoggedOut,
            },
        ),

        // --- Stale or irrelevant events ---
        (state, event) => {
            debug!(state = ?state, event = ?event, "ignoring channel event");
            (state, ChannelAction::None)
        }
    }
}

/// Backoff step for consecutive failure number `attempt`.
fn schedule(attempt: u32, reason: String, policy: &BackoffPolicy) -> (ChannelState, ChannelAction) {
    if attempt > policy.max_attempts {
        return (ChannelState::Failed, ChannelAction::GiveUp { reason });
    }
    (
        ChannelState::Reconnecting { attempt },
        ChannelAction::ScheduleReconnect {
            attempt,
            delay: policy.delay_for(attempt),
            reason,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::SERVER_DISCONNECT_REASON;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default()
    }

    fn closed(reason: &str) -> ChannelEvent {
        ChannelEvent::Closed {
            reason: reason.into(),
        }
    }

    fn open_failed() -> ChannelEvent {
        ChannelEvent::OpenFailed {
            reason: "connection refused".into(),
        }
    }

    #[test]
    fn connect_from_disconnected_opens() {
        let (state, action) =
            handle_event(ChannelState::Disconnected, ChannelEvent::ConnectRequested, &policy());
        assert_eq!(state, ChannelState::Connecting);
        assert_eq!(action, ChannelAction::Open);
    }

    #[test]
    fn connect_from_failed_opens() {
        let (state, action) =
            handle_event(ChannelState::Failed, ChannelEvent::ConnectRequested, &policy());
        assert_eq!(state, ChannelState::Connecting);
        assert_eq!(action, ChannelAction::Open);
    }

    #[test]
    fn connect_while_connected_is_noop() {
        let (state, action) =
            handle_event(ChannelState::Connected, ChannelEvent::ConnectRequested, &policy());
        assert_eq!(state, ChannelState::Connected);
        assert_eq!(action, ChannelAction::None);
    }

    #[test]
    fn opened_activates() {
        let (state, action) = handle_event(ChannelState::Connecting, ChannelEvent::Opened, &policy());
        assert_eq!(state, ChannelState::Connected);
        assert_eq!(action, ChannelAction::Activate);

        let (state, action) = handle_event(
            ChannelState::Reconnecting { attempt: 3 },
            ChannelEvent::Opened,
            &policy(),
        );
        assert_eq!(state, ChannelState::Connected);
        assert_eq!(action, ChannelAction::Activate);
    }

    #[test]
    fn backoff_sequence_then_failed() {
        let policy = policy();
        let (mut state, action) = handle_event(ChannelState::Connected, closed("transport close"), &policy);

        let mut delays = Vec::new();
        let mut action = action;
        loop {
            match action {
                ChannelAction::ScheduleReconnect { attempt, delay, .. } => {
                    delays.push(delay.as_millis() as u64);
                    assert_eq!(state, ChannelState::Reconnecting { attempt });
                    let (s, a) = handle_event(state, ChannelEvent::RetryTimer, &policy);
                    assert_eq!(a, ChannelAction::Open);
                    let (s, a) = handle_event(s, open_failed(), &policy);
                    state = s;
                    action = a;
                }
                ChannelAction::GiveUp { .. } => break,
                other => panic!("unexpected action {other:?}"),
            }
        }

        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 32000]);
        assert_eq!(state, ChannelState::Failed);
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(32000),
            max_attempts: 100,
        };
        assert_eq!(policy.delay_for(6), Duration::from_millis(32000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(32000));
    }

    #[test]
    fn server_disconnect_does_not_reconnect() {
        let (state, action) =
            handle_event(ChannelState::Connected, closed(SERVER_DISCONNECT_REASON), &policy());
        assert_eq!(state, ChannelState::Disconnected);
        assert_eq!(
            action,
            ChannelAction::Release {
                notice: ChannelNotice::Disconnected {
                    reason: SERVER_DISCONNECT_REASON.into()
                }
            }
        );
    }

    #[test]
    fn transport_error_reconnects() {
        let (state, action) = handle_event(
            ChannelState::Connected,
            ChannelEvent::TransportError {
                message: "ping timeout".into(),
            },
            &policy(),
        );
        assert_eq!(state, ChannelState::Reconnecting { attempt: 1 });
        assert!(matches!(action, ChannelAction::ScheduleReconnect { attempt: 1, .. }));
    }

    #[test]
    fn initial_open_failure_reconnects() {
        let (state, action) = handle_event(ChannelState::Connecting, open_failed(), &policy());
        assert_eq!(state, ChannelState::Reconnecting { attempt: 1 });
        assert!(matches!(
            action,
            ChannelAction::ScheduleReconnect { attempt: 1, delay, .. } if delay == Duration::from_millis(2000)
        ));
    }

    #[test]
    fn disconnect_cancels_from_any_state() {
        for state in [
            ChannelState::Connecting,
            ChannelState::Connected,
            ChannelState::Reconnecting { attempt: 2 },
            ChannelState::Refreshing,
            ChannelState::Reauthorizing,
            ChannelState::Failed,
        ] {
            let (next, action) = handle_event(state, ChannelEvent::DisconnectRequested, &policy());
            assert_eq!(next, ChannelState::Disconnected);
            assert!(matches!(action, ChannelAction::Release { .. }));
        }
        let (_, action) =
            handle_event(ChannelState::Disconnected, ChannelEvent::DisconnectRequested, &policy());
        assert_eq!(action, ChannelAction::None);
    }

    #[test]
    fn retry_timer_after_disconnect_is_ignored() {
        let (state, action) =
            handle_event(ChannelState::Disconnected, ChannelEvent::RetryTimer, &policy());
        assert_eq!(state, ChannelState::Disconnected);
        assert_eq!(action, ChannelAction::None);
    }

    #[test]
    fn auth_rejection_refreshes_then_reopens() {
        let (state, action) = handle_event(
            ChannelState::Connected,
            ChannelEvent::AuthRejected {
                reason: "jwt expired".into(),
            },
            &policy(),
        );
        assert_eq!(state, ChannelState::Refreshing);
        assert!(matches!(action, ChannelAction::RefreshCredential { .. }));
        assert_eq!(state.public(), ConnectionState::Connecting);

        let (state, action) = handle_event(state, ChannelEvent::AuthRefreshed, &policy());
        assert_eq!(state, ChannelState::Reauthorizing);
        assert_eq!(action, ChannelAction::Open);
        assert_eq!(state.public(), ConnectionState::Connecting);

        let (state, action) = handle_event(state, ChannelEvent::Opened, &policy());
        assert_eq!(state, ChannelState::Connected);
        assert_eq!(action, ChannelAction::Activate);
    }

    #[test]
    fn second_rejection_after_refresh_gives_up() {
        let (state, action) = handle_event(
            ChannelState::Reauthorizing,
            ChannelEvent::AuthRejected {
                reason: "forbidden".into(),
            },
            &policy(),
        );
        assert_eq!(state, ChannelState::Disconnected);
        assert_eq!(
            action,
            ChannelAction::Release {
                notice: ChannelNotice::AuthFailed {
                    reason: "forbidden".into()
                }
            }
        );

        // Network trouble on the re-handshake still takes the backoff path
        let (state, action) = handle_event(ChannelState::Reauthorizing, open_failed(), &policy());
        assert_eq!(state, ChannelState::Reconnecting { attempt: 1 });
        assert!(matches!(action, ChannelAction::ScheduleReconnect { attempt: 1, .. }));
    }

    #[test]
    fn failed_refresh_disconnects_with_auth_failed() {
        let (state, action) = handle_event(
            ChannelState::Refreshing,
            ChannelEvent::CredentialCleared,
            &policy(),
        );
        assert_eq!(state, ChannelState::Refreshing);
        assert_eq!(action, ChannelAction::None);

        let (state, action) = handle_event(
            state,
            ChannelEvent::AuthRefreshFailed {
                reason: "session expired".into(),
            },
            &policy(),
        );
        assert_eq!(state, ChannelState::Disconnected);
        assert_eq!(
            action,
            ChannelAction::Release {
                notice: ChannelNotice::AuthFailed {
                    reason: "session expired".into()
                }
            }
        );
    }

    #[test]
    fn token_rotation_reauthenticates_only_when_connected() {
        let (_, action) = handle_event(ChannelState::Connected, ChannelEvent::TokenRotated, &policy());
        assert_eq!(action, ChannelAction::Reauthenticate);

        let (_, action) = handle_event(
            ChannelState::Reconnecting { attempt: 1 },
            ChannelEvent::TokenRotated,
            &policy(),
        );
        assert_eq!(action, ChannelAction::None);
    }

    #[test]
    fn credential_clear_logs_out() {
        let (state, action) =
            handle_event(ChannelState::Connected, ChannelEvent::CredentialCleared, &policy());
        assert_eq!(state, ChannelState::Disconnected);
        assert_eq!(
            action,
            ChannelAction::Release {
                notice: ChannelNotice::LoggedOut
            }
        );
    }

    #[test]
    fn public_state_mapping() {
        assert_eq!(ChannelState::Reconnecting { attempt: 4 }.public(), ConnectionState::Reconnecting);
        assert_eq!(ConnectionState::Connected.label(), "connected");
    }
}
