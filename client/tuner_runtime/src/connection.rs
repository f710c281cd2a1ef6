use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::ProtocolError;
use crate::observable::Observable;
use crate::outbound::Outbound;
use crate::protocol::{
    NO_ENDPOINT, ServerMessage, TelemetryUpdate, decode_server_frame, decode_server_text,
};
use crate::sync::NodeSnapshot;
use crate::transport::Frame;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Failed(String),
}

impl ConnectionState {
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Failed(_))
                | (Self::Open, Self::Closed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// Client side of one socket: the two top-level containers presentation
/// code reads, and the dispatcher that keeps them in sync with the server.
///
/// A connection that has closed or failed stays that way; retrying means
/// building a new one.
pub struct Connection {
    state: Observable<ConnectionState>,
    available_endpoints: Observable<Vec<String>>,
    current_node: Observable<Option<Rc<NodeSnapshot>>>,
    disconnected: Observable<Option<String>>,
    outbound: Outbound,
    default_keep_last_secs: f64,
    max_inbound_frame: usize,
}

impl Connection {
    pub fn new(outbound: Outbound, config: &RuntimeConfig) -> Self {
        Self {
            state: Observable::new(ConnectionState::Connecting),
            available_endpoints: Observable::new(vec![NO_ENDPOINT.to_string()]),
            current_node: Observable::new(None),
            disconnected: Observable::new(None),
            outbound,
            default_keep_last_secs: config.default_keep_last_secs,
            max_inbound_frame: config.max_inbound_frame,
        }
    }

    pub fn state(&self) -> &Observable<ConnectionState> {
        &self.state
    }

    /// Endpoint identifiers the server offers, or `[NO_ENDPOINT]`.
    pub fn available_endpoints(&self) -> &Observable<Vec<String>> {
        &self.available_endpoints
    }

    pub fn current_node(&self) -> &Observable<Option<Rc<NodeSnapshot>>> {
        &self.current_node
    }

    /// Address of the last node that went away while selected.
    pub fn disconnected(&self) -> &Observable<Option<String>> {
        &self.disconnected
    }

    pub fn is_open(&self) -> bool {
        self.state.with(|state| *state == ConnectionState::Open)
    }

    /// Ask the server to stream `endpoint`. [`NO_ENDPOINT`] deselects.
    pub fn set_current_node(&self, endpoint: &str) {
        info!(endpoint, "choosing node");
        self.outbound.choose_node(endpoint);
    }

    pub fn mark_open(&self) -> bool {
        self.transition(ConnectionState::Open)
    }

    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        self.transition(ConnectionState::Failed(reason.into()))
    }

    /// Move to `Closed`, which also stops sending. Refused unless `Open`.
    pub fn close(&self) -> bool {
        self.transition(ConnectionState::Closed)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let current = self.state.get();
        if !current.can_transition_to(&next) {
            warn!(?current, ?next, "ignoring illegal connection state transition");
            return false;
        }
        info!(from = ?current, to = ?next, "connection state");
        if next.is_terminal() {
            self.outbound.close();
        }
        self.state.set(next);
        true
    }

    pub fn handle_frame(&self, frame: &Frame) -> Result<(), ProtocolError> {
        if !self.is_open() {
            debug!("dropping frame received while not open");
            return Ok(());
        }

        let message = match frame {
            Frame::Binary(payload) => decode_server_frame(payload, self.max_inbound_frame)?,
            Frame::Text(text) => decode_server_text(text, self.max_inbound_frame)?,
        };
        self.handle_message(message)
    }

    pub fn handle_message(&self, message: ServerMessage) -> Result<(), ProtocolError> {
        match message {
            ServerMessage::Telemetry(update) => self.apply_telemetry(update),
            ServerMessage::PatchBatch(patches) => {
                let node = self
                    .current_node
                    .get()
                    .ok_or(ProtocolError::NoCurrentNode("parameter patch"))?;
                let applied = node.apply_patches(&patches)?;
                debug!(applied, "parameter patch batch applied");
                Ok(())
            }
            ServerMessage::Endpoints(endpoints) => {
                self.update_endpoints(endpoints);
                Ok(())
            }
            ServerMessage::NodeDescription(description) => {
                let snapshot = NodeSnapshot::build(
                    description,
                    &self.outbound,
                    self.default_keep_last_secs,
                )?;
                info!(
                    address = %snapshot.address,
                    params = snapshot.id2param.len(),
                    scopes = snapshot.scopes.len(),
                    video_streams = snapshot.video_streams.len(),
                    "node description received"
                );
                self.current_node.set(Some(Rc::new(snapshot)));
                Ok(())
            }
        }
    }

    fn update_endpoints(&self, endpoints: Vec<String>) {
        let Some(first) = endpoints.first().cloned() else {
            self.available_endpoints.set(vec![NO_ENDPOINT.to_string()]);
            if let Some(node) = self.current_node.get() {
                warn!(address = %node.address, "node disconnected");
                self.current_node.set(None);
                self.disconnected.set(Some(node.address.clone()));
            }
            return;
        };

        info!(count = endpoints.len(), "available endpoints");
        self.available_endpoints.set(endpoints);
        self.set_current_node(&first);
    }

    fn apply_telemetry(&self, update: TelemetryUpdate) -> Result<(), ProtocolError> {
        let node = self
            .current_node
            .get()
            .ok_or(ProtocolError::NoCurrentNode("telemetry update"))?;
        let scope = node
            .scopes
            .get(update.scope_index)
            .ok_or(ProtocolError::ScopeOutOfRange {
                index: update.scope_index,
                len: node.scopes.len(),
            })?;
        scope.append(&update.times, &update.series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamValue;
    use crate::protocol::{ClientMessage, classify};
    use serde_json::{Value, json};
    use std::sync::mpsc::Receiver;

    fn open_connection() -> (Connection, Receiver<ClientMessage>) {
        let (outbound, rx) = Outbound::channel(16);
        let connection = Connection::new(outbound, &RuntimeConfig::default());
        assert!(connection.mark_open());
        (connection, rx)
    }

    fn deliver(connection: &Connection, value: Value) -> Result<(), ProtocolError> {
        connection.handle_message(classify(value)?)
    }

    fn describe_node(connection: &Connection) {
        deliver(
            connection,
            json!({
                "ip": "10.0.0.2:4000",
                "params": [
                    {"id": 1, "name": "outer", "params": {
                        "x": {"id": 2, "name": "x", "val": 5},
                        "y": {"id": 3, "name": "y", "params": {"z": {"id": 4, "name": "z", "val": "a"}}}
                    }}
                ],
                "signal_scopes": [{"name": "pos", "n": 1, "keep_last_secs": 1.0}]
            }),
        )
        .expect("node description");
    }

    #[test]
    fn state_machine_allows_only_forward_transitions() {
        let (outbound, _rx) = Outbound::channel(1);
        let connection = Connection::new(outbound, &RuntimeConfig::default());
        assert!(!connection.close());
        assert!(connection.mark_open());
        assert!(!connection.mark_open());
        assert!(!connection.mark_failed("late"));
        assert!(connection.close());
        assert_eq!(connection.state().get(), ConnectionState::Closed);
        assert!(!connection.mark_open());
    }

    #[test]
    fn failed_connect_is_terminal() {
        let (outbound, _rx) = Outbound::channel(1);
        let connection = Connection::new(outbound, &RuntimeConfig::default());
        assert!(connection.mark_failed("refused"));
        assert_eq!(
            connection.state().get(),
            ConnectionState::Failed("refused".into())
        );
        assert!(!connection.mark_open());
    }

    #[test]
    fn endpoint_list_selects_first_node() {
        let (connection, rx) = open_connection();
        deliver(&connection, json!({"available_endpoints": ["a:1", "b:2"]})).expect("endpoints");

        assert_eq!(connection.available_endpoints().get(), vec!["a:1", "b:2"]);
        assert_eq!(
            rx.try_recv().expect("choose"),
            ClientMessage::ChooseNode {
                chosen_node: "a:1".into()
            }
        );
    }

    #[test]
    fn node_description_builds_snapshot() {
        let (connection, _rx) = open_connection();
        describe_node(&connection);

        let node = connection.current_node().get().expect("node");
        let mut ids: Vec<_> = node.id2param.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(
            node.param(4).expect("z").get().value(),
            Some(ParamValue::Text("a".into()))
        );
    }

    #[test]
    fn empty_endpoint_list_clears_node() {
        let (connection, _rx) = open_connection();
        describe_node(&connection);

        deliver(&connection, json!({"available_endpoints": []})).expect("endpoints");

        assert!(connection.current_node().get().is_none());
        assert_eq!(connection.available_endpoints().get(), vec![NO_ENDPOINT]);
        assert_eq!(connection.disconnected().get(), Some("10.0.0.2:4000".into()));
    }

    #[test]
    fn telemetry_is_windowed() {
        let (connection, _rx) = open_connection();
        describe_node(&connection);

        deliver(&connection, json!([0, [9.0], [0.0]])).expect("seed");
        deliver(&connection, json!([0, [10.0, 11.0, 12.0], [1.0, 2.0, 3.0]])).expect("append");

        let node = connection.current_node().get().expect("node");
        assert_eq!(
            node.scopes[0].data.get(),
            vec![vec![11.0, 12.0], vec![2.0, 3.0]]
        );
    }

    #[test]
    fn telemetry_errors_are_reported() {
        let (connection, _rx) = open_connection();
        let err = deliver(&connection, json!([0, [1.0], [1.0]])).expect_err("no node");
        assert!(matches!(err, ProtocolError::NoCurrentNode(_)));

        describe_node(&connection);
        let err = deliver(&connection, json!([3, [1.0], [1.0]])).expect_err("bad index");
        assert!(matches!(err, ProtocolError::ScopeOutOfRange { index: 3, len: 1 }));
    }

    #[test]
    fn patch_for_unknown_id_changes_nothing() {
        let (connection, rx) = open_connection();
        describe_node(&connection);
        let node = connection.current_node().get().expect("node");
        let before: Vec<_> = (1..=4).map(|id| node.param(id).expect("param").get()).collect();

        let err = deliver(&connection, json!([{"id": 99, "name": "ghost", "val": 1}]))
            .expect_err("unknown id");

        assert!(matches!(err, ProtocolError::UnknownParamId(99)));
        let after: Vec<_> = (1..=4).map(|id| node.param(id).expect("param").get()).collect();
        assert_eq!(before, after);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn patch_reaches_subscribers_without_echo() {
        let (connection, rx) = open_connection();
        describe_node(&connection);
        let node = connection.current_node().get().expect("node");
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        node.param(2)
            .expect("x")
            .subscribe(move |param| sink.borrow_mut().push(param.value()));

        deliver(&connection, json!([{"id": 2, "name": "x", "val": 8}])).expect("patch");

        assert_eq!(*seen.borrow(), vec![Some(ParamValue::Number(8.0))]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_frames_are_errors_and_closed_connections_ignore_frames() {
        let (connection, _rx) = open_connection();
        let frame = Frame::Binary(rmp_serde::to_vec_named(&json!({"hello": 1})).expect("encode"));
        assert!(matches!(
            connection.handle_frame(&frame),
            Err(ProtocolError::UnknownShape(_))
        ));

        connection.close();
        assert!(connection.handle_frame(&frame).is_ok());
    }

    #[test]
    fn refused_close_keeps_the_encoder_open() {
        let (outbound, rx) = Outbound::channel(4);
        let connection = Connection::new(outbound, &RuntimeConfig::default());
        assert!(!connection.close());
        assert!(connection.mark_open());

        connection.set_current_node("a:1");

        assert_eq!(
            rx.try_recv().expect("choose"),
            ClientMessage::ChooseNode {
                chosen_node: "a:1".into()
            }
        );
    }

    #[test]
    fn rejected_description_keeps_previous_snapshot() {
        let (connection, _rx) = open_connection();
        describe_node(&connection);
        let before = connection.current_node().get().expect("node");
        let notified = Rc::new(std::cell::Cell::new(0));
        let counter = Rc::clone(&notified);
        connection
            .current_node()
            .subscribe(move |_| counter.set(counter.get() + 1));

        let duplicate = deliver(
            &connection,
            json!({
                "ip": "10.0.0.3:4000",
                "params": [
                    {"id": 7, "name": "a", "val": 1},
                    {"id": 7, "name": "b", "val": 2}
                ]
            }),
        )
        .expect_err("duplicate id");
        assert!(matches!(duplicate, ProtocolError::DuplicateParamId(7)));

        let malformed = deliver(
            &connection,
            json!({"ip": "10.0.0.3:4000", "params": [{"id": 8, "val": {"x": 1}}]}),
        )
        .expect_err("malformed parameter");
        assert!(matches!(malformed, ProtocolError::MalformedParam { id: 8, .. }));

        let oversized = deliver(
            &connection,
            json!({
                "ip": "10.0.0.3:4000",
                "params": [],
                "signal_scopes": [{"name": "s", "n": u64::MAX}]
            }),
        )
        .expect_err("oversized scope");
        assert!(matches!(oversized, ProtocolError::Malformed { .. }));

        let after = connection.current_node().get().expect("node");
        assert!(Rc::ptr_eq(&before, &after));
        let mut ids: Vec<_> = after.id2param.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(notified.get(), 0);
    }

    #[test]
    fn second_description_replaces_the_first_wholesale() {
        let (connection, _rx) = open_connection();
        describe_node(&connection);
        let first = connection.current_node().get().expect("first node");
        let notified = Rc::new(std::cell::Cell::new(0));
        let counter = Rc::clone(&notified);
        connection
            .current_node()
            .subscribe(move |_| counter.set(counter.get() + 1));

        deliver(
            &connection,
            json!({
                "ip": "10.0.0.9:4000",
                "params": [
                    {"id": 10, "name": "rate", "val": 0.5},
                    {"id": 11, "name": "grp", "params": {"w": {"id": 12, "name": "w", "val": true}}}
                ]
            }),
        )
        .expect("second description");

        assert_eq!(notified.get(), 1);
        let second = connection.current_node().get().expect("second node");
        assert_eq!(second.address, "10.0.0.9:4000");
        let mut ids: Vec<_> = second.id2param.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![10, 11, 12]);

        let old_cells: Vec<_> = first.id2param.values().cloned().collect();
        assert!(
            second
                .id2param
                .values()
                .all(|cell| old_cells.iter().all(|old| !old.ptr_eq(cell)))
        );
        assert!(
            second
                .params
                .iter()
                .all(|cell| old_cells.iter().all(|old| !old.ptr_eq(cell)))
        );
    }

    #[test]
    fn closed_connection_does_not_send() {
        let (connection, rx) = open_connection();
        connection.close();
        connection.set_current_node("a:1");
        assert!(rx.try_recv().is_err());
    }
}
