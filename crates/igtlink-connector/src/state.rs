//! Connector session state machine.
//!
//! [`next_state`] is the only place transitions are decided. The session
//! feeds it events produced by its own calls and by the transport, then acts
//! on the resulting state.

use igtlink_types::{ConnectorRole, ConnectorState};

/// Inputs that can move a session between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    Start,
    Stop,
    /// Server accepted a peer
    PeerAccepted,
    /// Client connect completed
    ConnectSucceeded,
    /// Client connect attempt failed
    ConnectFailed,
    /// Read/write error or peer close on an established connection
    ConnectionLost,
}

impl StateEvent {
    pub const ALL: [StateEvent; 6] = [
        StateEvent::Start,
        StateEvent::Stop,
        StateEvent::PeerAccepted,
        StateEvent::ConnectSucceeded,
        StateEvent::ConnectFailed,
        StateEvent::ConnectionLost,
    ];
}

/// Compute the state after `event`. Pairs with no rule keep `state`.
#[must_use]
pub fn next_state(
    state: ConnectorState,
    role: &ConnectorRole,
    persistent: bool,
    event: StateEvent,
) -> ConnectorState {
    use ConnectorState::{Connected, Connecting, Off, WaitConnection};

    match (state, event) {
        (_, StateEvent::Stop) => Off,
        (Off, StateEvent::Start) => waiting_state(role),
        (WaitConnection, StateEvent::PeerAccepted) if role.is_server() => Connected,
        (Connecting, StateEvent::ConnectSucceeded) if role.is_client() => Connected,
        (Connecting, StateEvent::ConnectFailed) => {
            if persistent {
                Connecting
            } else {
                Off
            }
        }
        (Connected, StateEvent::ConnectionLost) => waiting_state(role),
        (state, _) => state,
    }
}

fn waiting_state(role: &ConnectorRole) -> ConnectorState {
    match role {
        ConnectorRole::Server { .. } => ConnectorState::WaitConnection,
        ConnectorRole::Client { .. } => ConnectorState::Connecting,
        ConnectorRole::Unspecified => ConnectorState::Off,
    }
}
