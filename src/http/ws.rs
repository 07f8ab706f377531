//! WebSocket endpoint feeding connections into the hub.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::auth::AuthWorkspace;
use crate::sync::connection::{self, ConnectionReader};
use crate::sync::{Connection, Hub, SyncError, WorkspaceId};

/// WebSocket upgrade handler
pub async fn ws_handler(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Extension(AuthWorkspace(workspace_id)): Extension<AuthWorkspace>,
) -> Response {
    match connection::accept(upgrade, &headers, &state.origins) {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| handle_socket(socket, workspace_id, state))
            .into_response(),
        Err(e) => {
            warn!(workspace_id, "Handshake rejected: {}", e);
            e.into_response()
        }
    }
}

/// Run one connection until it closes
async fn handle_socket(socket: WebSocket, workspace_id: WorkspaceId, state: Arc<AppState>) {
    let hub = state.hub.clone();
    let connection = Connection::new(socket, Some(workspace_id), hub.config().outbound_queue);
    let handle = connection.handle();
    let client_id = handle.client_id().to_string();

    hub.register_connection(handle.clone());
    let (mut reader, writer) = connection.split();

    let mut send_task = tokio::spawn(writer.run(hub.shutdown_receiver(), hub.config().write_timeout));

    let recv_hub = hub.clone();
    let recv_id = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        read_loop(&mut reader, &recv_hub, &recv_id).await;
    });

    tokio::select! {
        result = &mut send_task => {
            recv_task.abort();
            if let Ok(Err(e)) = result {
                info!(client_id = %client_id, "Writer stopped: {}", e);
            }
        }
        _ = &mut recv_task => {
            // The reader closed the handle, so the writer is on its way out
            handle.close();
            if let Ok(Err(e)) = send_task.await {
                debug!(client_id = %client_id, "Writer stopped: {}", e);
            }
        }
    }

    hub.unregister_connection(&client_id);
}

async fn read_loop(reader: &mut ConnectionReader, hub: &Hub, client_id: &str) {
    loop {
        match reader.read_message().await {
            Ok(envelope) => {
                let file_id = envelope.file_id;
                if let Err(e) = hub.handle_envelope(client_id, envelope).await {
                    warn!(client_id, file_id, "Failed to process message: {}", e);
                }
            }
            Err(SyncError::MalformedMessage(e)) => {
                warn!(client_id, "Ignoring malformed message: {}", e);
            }
            Err(SyncError::ClientDisconnected(_)) => {
                debug!(client_id, "Client disconnected");
                break;
            }
            Err(e) => {
                warn!(client_id, "Read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::http::test_support::TestApp;
    use crate::sync::protocol::{Envelope, FileEvent};
    use crate::sync::HubConfig;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn serve(app: &TestApp) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, token: &str) -> Client {
        let url = format!("ws://{}/v1/sync?token={}", addr, token);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    async fn wait_for_connections(app: &TestApp, count: usize) {
        for _ in 0..100 {
            if app.state.hub.connection_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} connections", count);
    }

    async fn next_json(client: &mut Client) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_two_clients_converge() {
        let app = TestApp::new();
        let (_, token) = app.login("team").await;
        let addr = serve(&app).await;

        let mut x = connect(addr, &token).await;
        let mut y = connect(addr, &token).await;
        wait_for_connections(&app, 2).await;

        let edit = r#"{"fileId":1,"type":0,"chunks":[{"type":1,"position":0,"text":"Hello!","len":6}]}"#;
        x.send(Message::Text(edit.to_string())).await.unwrap();

        let msg = next_json(&mut y).await;
        assert_eq!(msg["fileId"], 1);
        assert_eq!(msg["type"], 0);
        assert_eq!(msg["chunks"][0]["type"], 1);
        assert_eq!(msg["chunks"][0]["position"], 0);
        assert_eq!(msg["chunks"][0]["text"], "Hello!");
        assert_eq!(msg["chunks"][0]["len"], 6);
        assert!(msg.get("senderId").is_none());

        assert_eq!(app.state.hub.file_content(1).await.as_deref(), Some("Hello!"));

        // The sender gets nothing back
        assert!(tokio::time::timeout(Duration::from_millis(200), x.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let app = TestApp::new();
        let (_, token) = app.login("team").await;
        let addr = serve(&app).await;

        let mut x = connect(addr, &token).await;
        let mut y = connect(addr, &token).await;
        wait_for_connections(&app, 2).await;

        for bad in [
            "not json",
            r#"{"type":0,"chunks":[]}"#,
            r#"{"fileId":0,"type":0,"chunks":[]}"#,
            r#"{"fileId":1,"type":9}"#,
        ] {
            x.send(Message::Text(bad.to_string())).await.unwrap();
        }
        x.send(Message::Text(r#"{"fileId":3,"type":2}"#.to_string()))
            .await
            .unwrap();

        let msg = next_json(&mut y).await;
        assert_eq!(msg, serde_json::json!({ "fileId": 3, "type": 2 }));
        assert_eq!(app.state.hub.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let app = TestApp::new();
        let (_, token) = app.login("team").await;
        let addr = serve(&app).await;

        let mut x = connect(addr, &token).await;
        wait_for_connections(&app, 1).await;

        x.close(None).await.unwrap();
        wait_for_connections(&app, 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let app = TestApp::new();
        let (_, token) = app.login("team").await;
        let addr = serve(&app).await;

        let mut x = connect(addr, &token).await;
        wait_for_connections(&app, 1).await;

        app.state.hub.shutdown();

        let msg = tokio::time::timeout(Duration::from_secs(2), x.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_client_is_closed_with_policy_violation() {
        let app = TestApp::with_config(HubConfig {
            outbound_queue: 1,
            broadcast_burst: 64,
            ..Default::default()
        });
        let (_, token) = app.login("team").await;
        let addr = serve(&app).await;

        let mut slow = connect(addr, &token).await;
        wait_for_connections(&app, 1).await;

        // Nothing yields between these, so the writer cannot drain the queue
        let mut delivered = 0;
        for _ in 0..3 {
            delivered += app
                .state
                .hub
                .broadcast(None, Envelope::event(1, FileEvent::Rename))
                .await;
        }
        assert_eq!(delivered, 1);

        let frame = loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), slow.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Close(frame) = msg {
                break frame.unwrap();
            }
        };
        assert_eq!(frame.code, CloseCode::Policy);
        assert_eq!(frame.reason, "connection too slow to keep up with messages");

        wait_for_connections(&app, 0).await;
    }

    #[tokio::test]
    async fn test_upgrade_requires_token() {
        let app = TestApp::new();
        let addr = serve(&app).await;

        let err = connect_async(format!("ws://{}/v1/sync", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Http(resp) if resp.status() == 401));
    }

    #[tokio::test]
    async fn test_forbidden_origin_is_rejected() {
        let app = TestApp::new();
        let (_, token) = app.login("team").await;
        let addr = serve(&app).await;

        let mut request = format!("ws://{}/v1/sync?token={}", addr, token)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://evil.example".parse().unwrap());

        let err = connect_async(request).await.unwrap_err();
        assert!(matches!(err, WsError::Http(resp) if resp.status() == 403));
    }
}
