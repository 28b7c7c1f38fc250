#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use chatline_api::{AppState, AppStateInner, CoreConfig};
use chatline_db::{Database, Store};
use chatline_gateway::{Broker, MemoryBroker};
use chatline_types::events::ServerEvent;
use chatline_types::models::{Room, RoomState, RoomType, UserProfile};

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// One running instance: real router on an ephemeral port.
pub struct Node {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl Node {
    pub async fn start(db: Arc<Database>, broker: Arc<dyn Broker>, node_id: &str) -> Self {
        let store = Store::new(db, Duration::from_secs(2));
        let state = AppStateInner::compose(
            store,
            broker,
            CoreConfig {
                node_id: node_id.into(),
                admin_token: Some(ADMIN_TOKEN.into()),
                ..CoreConfig::default()
            },
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = chatline_api::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self, room_id: Uuid, user_id: Uuid) -> Client {
        let url = format!("ws://{}/ws/{}/{}", self.addr, room_id, user_id);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Client { ws }
    }

    /// Polls until the condition holds or two seconds pass.
    pub async fn eventually(&self, mut check: impl FnMut(&AppState) -> bool) {
        for _ in 0..200 {
            if check(&self.state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}

/// Fresh in-memory store plus the broker every node of a test shares.
pub fn backing() -> (Arc<Database>, Arc<dyn Broker>) {
    (
        Arc::new(Database::open_in_memory().unwrap()),
        Arc::new(MemoryBroker::default()),
    )
}

pub fn seed_room(db: &Database, room_type: RoomType) -> Uuid {
    let id = Uuid::new_v4();
    db.create_room(&Room {
        id,
        name: "lobby".into(),
        room_type,
        state: RoomState::Active,
        capacity: None,
        updated_at: Utc::now(),
    })
    .unwrap();
    id
}

pub fn seed_user(db: &Database, username: &str) -> Uuid {
    let id = Uuid::new_v4();
    db.upsert_user(&UserProfile {
        id,
        username: username.into(),
        display_name: None,
    })
    .unwrap();
    id
}

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    pub async fn send(&mut self, text: &str) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    /// Next server frame, or None once the server closed the socket.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("no frame within 5s");
            match next {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn expect_event(&mut self) -> ServerEvent {
        self.next_event().await.expect("socket closed")
    }

    /// Skips the room status and the given number of history frames.
    pub async fn joined(&mut self, history: usize) -> Vec<ServerEvent> {
        let first = self.expect_event().await;
        assert!(matches!(first, ServerEvent::RoomStatus(_)), "got {first:?}");
        let mut frames = Vec::with_capacity(history);
        for _ in 0..history {
            frames.push(self.expect_event().await);
        }
        frames
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
