//! rt-test-utils: a mock RTU server for integration-testing `rtu-client`
//! against the real wire protocol over a real local TCP/WebSocket listener.
//!
//! Grounded on the teacher's `MockWsServer`/`MockWsClient` pair: same
//! accept-loop-per-connection shape, same random-port bind, generalized from
//! a fixed forwarder/receiver handshake to the scriptable
//! [`MockRtuConnection`] the RTU protocol's many scenarios need.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockRtuClient;
pub use mock_ws_server::{MockRtuConnection, MockRtuServer};

#[cfg(test)]
mod tests {
    use super::*;
    use rt_protocol::RtuFrame;
    use serde_json::json;

    #[tokio::test]
    async fn server_starts_and_reports_a_real_port() {
        let server = MockRtuServer::start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn connection_round_trips_a_frame() {
        let mut server = MockRtuServer::start().await.unwrap();
        let url = server.ws_url();

        let client_task = tokio::spawn(async move {
            let mut client = MockRtuClient::connect(&url).await.unwrap();
            let frame = RtuFrame::request("system", "ping_request", json!({}));
            client.send_frame(&frame).await.unwrap();
            client.recv_frame().await.unwrap()
        });

        let mut conn = server.accept().await;
        let received = conn.recv_frame().await.unwrap();
        assert_eq!(received.event, "ping_request");

        conn.reply(received.transaction_id, "system", "pong_reply", json!({}))
            .await
            .unwrap();

        let reply = client_task.await.unwrap();
        assert_eq!(reply.event, "pong_reply");
        assert_eq!(reply.transaction_id, received.transaction_id);
    }

    #[tokio::test]
    async fn broadcast_carries_its_own_transaction_id() {
        let mut server = MockRtuServer::start().await.unwrap();
        let url = server.ws_url();

        let client_task = tokio::spawn(async move {
            MockRtuClient::connect(&url)
                .await
                .unwrap()
                .recv_frame()
                .await
        });

        let mut conn = server.accept().await;
        conn.broadcast("files/abc", "new_delta_event", json!({"delta": {}}))
            .await
            .unwrap();

        let received = client_task.await.unwrap().unwrap();
        assert_eq!(received.channel, "files/abc");
        assert_eq!(received.event, "new_delta_event");
    }
}
