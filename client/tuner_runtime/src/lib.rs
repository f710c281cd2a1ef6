//! Client-side synchronization engine for remote parameter tuning.
//!
//! One websocket carries everything: the list of nodes the server can reach,
//! a description of the selected node's parameter tree and telemetry scopes,
//! server-side parameter patches, and telemetry samples. This crate keeps a
//! graph of [`Observable`] containers in sync with that stream and turns
//! local edits back into outbound messages.
//!
//! All handling runs on one thread: [`run`] reads a frame, dispatches it to
//! completion, lets the [`Presenter`] act, then flushes queued edits.

pub mod config;
pub mod connection;
pub mod error;
pub mod observable;
pub mod outbound;
pub mod param;
pub mod protocol;
pub mod sync;
pub mod telemetry;
pub mod transport;

use std::ops::ControlFlow;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use tracing::{error, info, warn};

pub use crate::config::RuntimeConfig;
pub use crate::connection::{Connection, ConnectionState};
pub use crate::error::{ConfigError, ParamError, ProtocolError, TransportError};
pub use crate::observable::{Observable, SubscriptionId};
pub use crate::param::{Param, ParamCell, ParamId, ParamKind, ParamValue, Scalar};
pub use crate::protocol::{ClientMessage, NO_ENDPOINT, ServerMessage};
pub use crate::sync::NodeSnapshot;
pub use crate::telemetry::{ScopeData, TelemetryScope};
pub use crate::transport::{Frame, Transport, WsTransport};
pub use serde_json;

/// The presentation side of a session. It only reads observables and calls
/// `Observable::set` / `Connection::set_current_node`.
pub trait Presenter {
    /// Called once, before the socket opens, so state transitions are seen.
    fn attach(&mut self, connection: &Connection);

    /// Called after every frame or poll timeout. `Break` ends the session.
    fn tick(&mut self, connection: &Connection) -> ControlFlow<()> {
        let _ = connection;
        ControlFlow::Continue(())
    }

    fn on_protocol_error(&mut self, err: &ProtocolError) {
        let _ = err;
    }
}

/// Connect to `config.url` and run the session until the server closes the
/// socket, the transport fails, or the presenter breaks.
pub fn run<P: Presenter>(
    config: &RuntimeConfig,
    presenter: &mut P,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    let (outbound, rx) = outbound::Outbound::channel(config.outbound_queue_cap);
    let connection = Connection::new(outbound, config);
    presenter.attach(&connection);

    info!(url = %config.url, "connecting");
    let transport = match WsTransport::connect(&config.url) {
        Ok(transport) => transport,
        Err(err) => {
            connection.mark_failed(err.to_string());
            return Err(err.into());
        }
    };

    drive(transport, &connection, &rx, presenter, config.poll_interval)?;
    Ok(())
}

/// Run a session over an already-open transport.
pub fn run_with_transport<T: Transport, P: Presenter>(
    transport: T,
    config: &RuntimeConfig,
    presenter: &mut P,
) -> Result<(), TransportError> {
    let (outbound, rx) = outbound::Outbound::channel(config.outbound_queue_cap);
    let connection = Connection::new(outbound, config);
    presenter.attach(&connection);
    drive(transport, &connection, &rx, presenter, config.poll_interval)
}

fn drive<T: Transport, P: Presenter>(
    mut transport: T,
    connection: &Connection,
    rx: &Receiver<ClientMessage>,
    presenter: &mut P,
    poll_interval: Duration,
) -> Result<(), TransportError> {
    connection.mark_open();

    let result = loop {
        match transport.recv(poll_interval) {
            Ok(Some(frame)) => {
                if let Err(err) = connection.handle_frame(&frame) {
                    warn!(%err, "skipping frame");
                    presenter.on_protocol_error(&err);
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => break Ok(()),
            Err(err) => {
                error!(%err, "transport failed");
                break Err(err);
            }
        }

        let flow = presenter.tick(connection);

        if let Err(err) = flush_outbound(&mut transport, rx) {
            error!(%err, "failed to send");
            break Err(err);
        }

        if flow.is_break() {
            info!("session ended by presenter");
            break Ok(());
        }
    };

    connection.close();
    transport.close();
    result
}

fn flush_outbound<T: Transport>(
    transport: &mut T,
    rx: &Receiver<ClientMessage>,
) -> Result<(), TransportError> {
    while let Ok(message) = rx.try_recv() {
        match protocol::encode_client_message(&message) {
            Ok(payload) => transport.send(payload)?,
            Err(err) => warn!(%err, ?message, "dropping unencodable message"),
        }
    }
    Ok(())
}
