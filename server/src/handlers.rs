//! # WebSocket Handlers
//!
//! The persistent-connection binding:
//! - Upgrading HTTP connections to WebSocket
//! - Managing the lifecycle of each connection (outbound task, cleanup)
//! - Dispatching incoming messages to the rendezvous engine
//! - Pushing payloads from the opposite side as they arrive
//!
//! A connection registers as either the device or the client of one tunnel.
//! Payloads for it are pushed straight down the socket instead of being
//! polled for. When an attached connection closes, the whole tunnel is torn
//! down and the peer connection is closed too.

use crate::engine::Attachment;
use crate::error::RelayError;
use crate::protocol::{Payload, WsMessage};
use crate::registry::generate_tunnel_id;
use crate::state::AppState;
use crate::tunnel::PushSink;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type ClientTx = mpsc::UnboundedSender<WsMessage>;

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /ws` — Upgrades the HTTP connection to a WebSocket connection.
///
/// This is the entry point for both devices and clients. After the upgrade,
/// the connection is handled by [`handle_connection`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-connection registration state.
struct Session {
    /// Handed to the engine on registration. Dropping it unregistered
    /// closes the connection.
    push_tx: Option<PushSink>,
    attachment: Option<Attachment>,
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of a single WebSocket connection.
///
/// ## Flow:
/// 1. Assign a connection ID (for logs only)
/// 2. Split the socket into a sink (outbound) and stream (inbound)
/// 3. Spawn an outbound task that writes control replies and pushed payloads
/// 4. Process incoming messages on the current task
/// 5. On disconnect: detach from the tunnel, tearing it down
async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Control replies (registered, errors, pong) for this connection.
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    // Payloads pushed by the engine once this connection is attached.
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Payload>();

    let mut session = Session {
        push_tx: Some(push_tx),
        attachment: None,
    };

    // ── Outbound Task ──
    // Control replies go first so that `registered`/`connected` always
    // precede the first pushed payload. When the engine drops the push
    // channel (tunnel torn down) the socket is closed.
    let mut outbound_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                payload = push_rx.recv() => match payload {
                    Some(data) => WsMessage::Data { data },
                    None => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                },
            };
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("Serialize error: {}", e);
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break; // WebSocket closed; stop sending
            }
        }
    });

    // ── Inbound Loop ──
    // Text frames carry JSON messages; anything unparseable is dropped.
    // The loop also ends when the outbound side closes the socket.
    loop {
        tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<WsMessage>(&text) {
                    Ok(msg) => handle_message(&state, &conn_id, &tx, &mut session, msg),
                    Err(e) => warn!(conn_id = %conn_id, error = %e, "Dropping malformed frame"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut outbound_task => break,
        }
    }

    // ── Cleanup on Disconnect ──
    info!(conn_id = %conn_id, "Disconnecting");
    outbound_task.abort();

    if let Some(attachment) = session.attachment.take() {
        if state.engine.detach(&attachment) {
            info!(
                conn_id = %conn_id,
                tunnel_id = %attachment.tunnel_id,
                side = %attachment.side,
                "Tunnel torn down"
            );
        }
    }
}

// ─── Message Dispatcher ─────────────────────────────────────────

/// Handles a single incoming WebSocket message.
///
/// - **RegisterDevice**: Registers the tunnel and attaches this connection as its device
/// - **RegisterClient**: Attaches this connection as the client of an existing tunnel
/// - **Data**: Submitted on this connection's side
/// - **Ping/Pong**: Heartbeat handling
fn handle_message(
    state: &AppState,
    conn_id: &str,
    tx: &ClientTx,
    session: &mut Session,
    msg: WsMessage,
) {
    match msg {
        // ── Device Registration ──
        WsMessage::RegisterDevice {
            tunnel_id,
            target_info,
        } => {
            let Some(push_tx) = take_push_tx(tx, session) else {
                return;
            };
            let tunnel_id = tunnel_id.unwrap_or_else(generate_tunnel_id);
            info!(
                conn_id = %conn_id,
                tunnel_id = %tunnel_id,
                target = %target_info,
                "Device registered"
            );

            // Acknowledge before attaching so the reply precedes flushed data
            let _ = tx.send(WsMessage::Registered {
                tunnel_id: tunnel_id.clone(),
            });
            match state.engine.attach_device(&tunnel_id, target_info, push_tx) {
                Ok(attachment) => session.attachment = Some(attachment),
                Err(e) => send_error(tx, &e),
            }
        }

        // ── Client Joins a Tunnel ──
        WsMessage::RegisterClient { tunnel_id } => {
            let Some(push_tx) = take_push_tx(tx, session) else {
                return;
            };
            info!(conn_id = %conn_id, tunnel_id = %tunnel_id, "Client joining");

            let target_info = match state.engine.target_info(&tunnel_id) {
                Ok(target_info) => target_info,
                Err(_) => {
                    // push_tx is dropped here, which closes the connection
                    // once the error has been written.
                    let _ = tx.send(WsMessage::Error {
                        message: "Tunnel not found or device not connected".to_string(),
                    });
                    return;
                }
            };
            let _ = tx.send(WsMessage::Connected { target_info });
            match state.engine.attach_client(&tunnel_id, push_tx) {
                Ok(attachment) => session.attachment = Some(attachment),
                Err(e) => send_error(tx, &e),
            }
        }

        // ── Data Relay: submit on this connection's side ──
        WsMessage::Data { data } => {
            let Some(attachment) = &session.attachment else {
                send_error(tx, &RelayError::NotRegistered);
                return;
            };
            match state.engine.submit(&attachment.tunnel_id, attachment.side, data) {
                Ok(routed) => debug!(
                    conn_id = %conn_id,
                    tunnel_id = %attachment.tunnel_id,
                    from = %attachment.side,
                    routed = ?routed,
                    "Relayed payload"
                ),
                Err(e) => send_error(tx, &e),
            }
        }

        // ── Heartbeat ──
        WsMessage::Ping => {
            let _ = tx.send(WsMessage::Pong);
        }
        WsMessage::Pong => {
            // No action needed; the pong confirms the connection is alive
        }

        other => {
            warn!(conn_id = %conn_id, message = ?other, "Ignoring server-only message");
        }
    }
}

/// Hands out this connection's push channel for its one and only
/// registration. A second registration is answered with an error.
fn take_push_tx(tx: &ClientTx, session: &mut Session) -> Option<PushSink> {
    if let Some(attachment) = &session.attachment {
        send_error(tx, &RelayError::AlreadyRegistered(attachment.tunnel_id.clone()));
        return None;
    }
    session.push_tx.take()
}

fn send_error(tx: &ClientTx, error: &RelayError) {
    let _ = tx.send(WsMessage::Error {
        message: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tunnel::Side;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (
        AppState,
        ClientTx,
        mpsc::UnboundedReceiver<WsMessage>,
        Session,
        mpsc::UnboundedReceiver<Payload>,
    ) {
        let state = AppState::new(&Config::default(), CancellationToken::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let session = Session {
            push_tx: Some(push_tx),
            attachment: None,
        };
        (state, tx, rx, session, push_rx)
    }

    #[test]
    fn test_device_registration_attaches_and_acknowledges() {
        let (state, tx, mut rx, mut session, _push_rx) = setup();
        handle_message(
            &state,
            "c1",
            &tx,
            &mut session,
            WsMessage::RegisterDevice {
                tunnel_id: Some("t".to_string()),
                target_info: json!({"ip": "192.168.4.1", "port": 80}),
            },
        );

        assert_eq!(
            rx.try_recv().unwrap(),
            WsMessage::Registered {
                tunnel_id: "t".to_string()
            }
        );
        assert_eq!(session.attachment.as_ref().unwrap().side, Side::Device);
        assert!(state.engine.list()[0].device_connected);
    }

    #[test]
    fn test_device_registration_generates_id() {
        let (state, tx, mut rx, mut session, _push_rx) = setup();
        handle_message(
            &state,
            "c1",
            &tx,
            &mut session,
            WsMessage::RegisterDevice {
                tunnel_id: None,
                target_info: json!({}),
            },
        );

        match rx.try_recv().unwrap() {
            WsMessage::Registered { tunnel_id } => assert_eq!(tunnel_id.len(), 12),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_client_join_unknown_tunnel_errors_and_closes() {
        let (state, tx, mut rx, mut session, mut push_rx) = setup();
        handle_message(
            &state,
            "c1",
            &tx,
            &mut session,
            WsMessage::RegisterClient {
                tunnel_id: "missing".to_string(),
            },
        );

        assert!(matches!(rx.try_recv().unwrap(), WsMessage::Error { .. }));
        assert!(session.attachment.is_none());
        // push channel dropped: the outbound task will close the socket
        assert!(matches!(
            push_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_second_registration_is_rejected() {
        let (state, tx, mut rx, mut session, _push_rx) = setup();
        let register = WsMessage::RegisterDevice {
            tunnel_id: Some("t".to_string()),
            target_info: json!({}),
        };
        handle_message(&state, "c1", &tx, &mut session, register.clone());
        handle_message(&state, "c1", &tx, &mut session, register);

        assert!(matches!(rx.try_recv().unwrap(), WsMessage::Registered { .. }));
        assert!(matches!(rx.try_recv().unwrap(), WsMessage::Error { .. }));
    }

    #[test]
    fn test_data_before_registration_is_rejected() {
        let (state, tx, mut rx, mut session, _push_rx) = setup();
        handle_message(&state, "c1", &tx, &mut session, WsMessage::Data { data: json!("x") });
        assert!(matches!(rx.try_recv().unwrap(), WsMessage::Error { .. }));
    }

    #[test]
    fn test_device_data_queues_until_client_joins() {
        let (state, device_tx, _device_rx, mut device, _device_push) = setup();
        handle_message(
            &state,
            "device",
            &device_tx,
            &mut device,
            WsMessage::RegisterDevice {
                tunnel_id: Some("t".to_string()),
                target_info: json!({"port": 80}),
            },
        );
        handle_message(
            &state,
            "device",
            &device_tx,
            &mut device,
            WsMessage::Data {
                data: json!("early"),
            },
        );

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (client_push, mut client_push_rx) = mpsc::unbounded_channel();
        let mut client = Session {
            push_tx: Some(client_push),
            attachment: None,
        };
        handle_message(
            &state,
            "client",
            &client_tx,
            &mut client,
            WsMessage::RegisterClient {
                tunnel_id: "t".to_string(),
            },
        );

        assert_eq!(
            client_rx.try_recv().unwrap(),
            WsMessage::Connected {
                target_info: json!({"port": 80})
            }
        );
        assert_eq!(client_push_rx.try_recv().unwrap(), json!("early"));
    }

    #[test]
    fn test_ping_is_answered() {
        let (state, tx, mut rx, mut session, _push_rx) = setup();
        handle_message(&state, "c1", &tx, &mut session, WsMessage::Ping);
        assert_eq!(rx.try_recv().unwrap(), WsMessage::Pong);
    }
}
