use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use huddle::config::MeshConfig;
use huddle::mesh::sim::SimFactory;
use huddle::mesh::{LinkState, MeshClient, MeshEvent};
use huddle::signaling::{RoomKey, ServerMessage, SignalingServer};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

async fn start_server() -> (Arc<SignalingServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SignalingServer::default());
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (server, format!("ws://{}", addr))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_server_message<S>(ws: &mut S) -> ServerMessage
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn raw_socket_join_and_bad_input() {
    let (server, url) = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::text("{not json")).await.unwrap();
    assert!(matches!(
        next_server_message(&mut ws).await,
        ServerMessage::Error { message } if message.starts_with("Invalid message")
    ));

    ws.send(Message::text(r#"{"type":"offer","sdp":"v=0","to":"conn_x","from":"conn_y"}"#))
        .await
        .unwrap();
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::Error {
            message: "join a room first".into()
        }
    );

    ws.send(Message::text(r#"{"type":"join","room":"lobby","name":"ana"}"#))
        .await
        .unwrap();
    let conn_id = match next_server_message(&mut ws).await {
        ServerMessage::Joined {
            conn_id,
            room,
            peers,
        } => {
            assert_eq!(room, RoomKey::from("lobby"));
            assert!(peers.is_empty());
            conn_id
        }
        other => panic!("expected joined, got {:?}", other),
    };
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::Roster {
            names: vec!["ana".into()]
        }
    );
    assert!(server.directory().is_live(&conn_id));

    // Closing the socket is a departure.
    ws.close(None).await.unwrap();
    let lobby = RoomKey::from("lobby");
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.directory().room(&lobby).await.is_some() {
        assert!(Instant::now() < deadline, "room survived disconnect");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!server.directory().is_live(&conn_id));
}

#[tokio::test]
async fn two_clients_connect_over_websocket() {
    let (server, url) = start_server().await;

    let ana = MeshClient::connect(
        &url,
        "standup",
        "ana",
        MeshConfig::default(),
        Arc::new(SimFactory::new()),
    )
    .await
    .unwrap();
    eventually("ana joined", || ana.local_id().is_some()).await;

    let bo = MeshClient::connect(
        &url,
        "standup",
        "bo",
        MeshConfig::default(),
        Arc::new(SimFactory::new()),
    )
    .await
    .unwrap();
    eventually("bo joined", || bo.local_id().is_some()).await;

    let (ana_id, bo_id) = (ana.local_id().unwrap(), bo.local_id().unwrap());
    eventually("link up", || {
        ana.view().link_states().get(&bo_id) == Some(&LinkState::Connected)
            && bo.view().link_states().get(&ana_id) == Some(&LinkState::Connected)
    })
    .await;
    assert!(server.relay().stats().delivered() > 0);

    bo.send_chat("morning").unwrap();
    let expected = MeshEvent::Chat {
        display_name: "bo".into(),
        text: "morning".into(),
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, ana.view().events.recv())
            .await
            .expect("chat in time")
            .unwrap();
        if event == expected {
            break;
        }
    }

    bo.leave().await;
    eventually("bo gone", || {
        ana.view().roster() == ["ana"] && ana.view().link_states().is_empty()
    })
    .await;
    assert!(!server.directory().is_live(&bo_id));

    ana.leave().await;
}
