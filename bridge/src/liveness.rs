//! Tracks the local broker session and its upstream cloud link.
//!
//! The cloud side is observed through the broker's reserved
//! connection-state topic (`1` = bridged to the cloud, `0` = not). Losing an
//! established cloud link is the moment to re-register: the server may have
//! reset our bridging credentials while we were linked, and reconnection is
//! the only point where fresh credentials matter. The machine is advisory
//! and never affects local mirroring.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    Disconnected,
    ConnectedLocal,
    ConnectedToCloud,
    DisconnectedFromCloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkAction {
    None,
    Reregister,
}

#[derive(Debug)]
pub(crate) struct BrokerLink {
    state: LinkState,
}

impl BrokerLink {
    pub(crate) fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn session_established(&mut self) {
        self.state = LinkState::ConnectedLocal;
    }

    pub(crate) fn session_lost(&mut self) {
        self.state = LinkState::Disconnected;
    }

    /// Feeds a payload from the reserved connection-state topic.
    pub(crate) fn connection_state_message(&mut self, payload: &[u8]) -> LinkAction {
        let connected = match std::str::from_utf8(payload)
            .ok()
            .and_then(|text| text.trim().parse::<i32>().ok())
        {
            Some(state) => state == 1,
            None => {
                tracing::warn!(?payload, "unparseable connection state payload");
                return LinkAction::None;
            }
        };

        if connected {
            tracing::info!("connected to cloud broker");
            self.state = LinkState::ConnectedToCloud;
            LinkAction::None
        } else if self.state == LinkState::ConnectedToCloud {
            tracing::error!("lost connection with cloud broker");
            self.state = LinkState::DisconnectedFromCloud;
            LinkAction::Reregister
        } else {
            LinkAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_roundtrip_registers_exactly_once() {
        let mut link = BrokerLink::new();
        link.session_established();

        assert_eq!(link.connection_state_message(b"1"), LinkAction::None);
        assert_eq!(link.state(), LinkState::ConnectedToCloud);
        assert_eq!(link.connection_state_message(b"0"), LinkAction::Reregister);
        assert_eq!(link.state(), LinkState::DisconnectedFromCloud);
        assert_eq!(link.connection_state_message(b"1"), LinkAction::None);
        assert_eq!(link.state(), LinkState::ConnectedToCloud);
    }

    #[test]
    fn zero_before_any_cloud_connection_is_ignored() {
        let mut link = BrokerLink::new();
        link.session_established();

        assert_eq!(link.connection_state_message(b"0"), LinkAction::None);
        assert_eq!(link.state(), LinkState::ConnectedLocal);
    }

    #[test]
    fn repeated_zeroes_register_once() {
        let mut link = BrokerLink::new();
        link.session_established();
        link.connection_state_message(b"1");

        assert_eq!(link.connection_state_message(b"0"), LinkAction::Reregister);
        assert_eq!(link.connection_state_message(b"0"), LinkAction::None);
    }

    #[test]
    fn garbage_payloads_are_ignored() {
        let mut link = BrokerLink::new();
        link.session_established();
        link.connection_state_message(b"1");

        assert_eq!(link.connection_state_message(b"up"), LinkAction::None);
        assert_eq!(link.state(), LinkState::ConnectedToCloud);
    }

    #[test]
    fn local_session_loss_resets_the_machine() {
        let mut link = BrokerLink::new();
        link.session_established();
        link.connection_state_message(b"1");
        link.session_lost();

        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
