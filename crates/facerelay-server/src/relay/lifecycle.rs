use facerelay_protocol::LifecycleState;

/// Transport states reported by the media session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What the connection manager has to do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Media and transport are both up; start capturing
    Establish,
    /// Session is over; tear it down
    Terminate(LifecycleState),
}

/// Per-connection state machine.
///
/// `New -> Negotiating -> Established -> {Failed | Closed}`. A connection is
/// established once it has both received a video track and seen the transport
/// connect, in either order. A transient disconnect is not terminal. Terminal
/// states ignore further events.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LifecycleState,
    track_seen: bool,
    transport_connected: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::New,
            track_seen: false,
            transport_connected: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn begin_negotiation(&mut self) {
        if self.state == LifecycleState::New {
            self.state = LifecycleState::Negotiating;
        }
    }

    pub fn on_track(&mut self) -> Transition {
        if self.state.is_terminal() {
            return Transition::None;
        }
        self.track_seen = true;
        self.try_establish()
    }

    pub fn on_transport(&mut self, transport: TransportState) -> Transition {
        if self.state.is_terminal() {
            return Transition::None;
        }

        match transport {
            TransportState::Connected => {
                self.transport_connected = true;
                self.try_establish()
            }
            TransportState::Failed => self.terminate(LifecycleState::Failed),
            TransportState::Closed => self.terminate(LifecycleState::Closed),
            // ICE may still recover; the transport reports Failed if it does not
            TransportState::Disconnected => {
                if self.state != LifecycleState::Established {
                    self.transport_connected = false;
                }
                Transition::None
            }
            TransportState::New | TransportState::Connecting => Transition::None,
        }
    }

    /// Local close, e.g. on reconnect or shutdown
    pub fn close(&mut self) -> Transition {
        if self.state.is_terminal() {
            return Transition::None;
        }
        self.terminate(LifecycleState::Closed)
    }

    fn try_establish(&mut self) -> Transition {
        if self.state == LifecycleState::Established {
            return Transition::None;
        }
        if self.track_seen && self.transport_connected {
            self.state = LifecycleState::Established;
            Transition::Establish
        } else {
            Transition::None
        }
    }

    fn terminate(&mut self, state: LifecycleState) -> Transition {
        self.state = state;
        Transition::Terminate(state)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
