//! Shared fixture for handler tests: a dispatcher over the memory backend
//! and helpers to drive it one envelope at a time.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::{BackendClient, BackendTimeouts, MemoryBackend};
use crate::network::dispatch::Dispatcher;
use crate::network::protocol::{
    Envelope, ErrorCode, Message, Metadata, RoomCreate, RoomJoin, SessionConnect,
};
use crate::network::session::{Session, SessionRegistry};
use crate::state::objects::ObjectRegistry;
use crate::state::room::RoomManager;
use crate::state::rpc::RpcRouter;

pub(crate) struct Harness {
    pub dispatcher: Dispatcher,
    pub rooms: Arc<RoomManager>,
    pub objects: Arc<ObjectRegistry>,
    pub backend: Arc<MemoryBackend>,
}

/// One authenticated connection.
pub(crate) struct Client {
    pub session: Arc<Session>,
    pub rx: mpsc::Receiver<Envelope>,
    pub player_id: String,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let backend = Arc::new(MemoryBackend::default());
        let client = BackendClient::new(backend.clone(), BackendTimeouts::default());
        let rooms = Arc::new(RoomManager::new(Some(client.clone())));
        let objects = Arc::new(ObjectRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::new(SessionRegistry::new()),
            rooms.clone(),
            objects.clone(),
            Arc::new(RpcRouter::new()),
            client,
        );
        Self {
            dispatcher,
            rooms,
            objects,
            backend,
        }
    }

    /// Open a session and authenticate it with `device`.
    pub(crate) async fn connect(&self, device: &str) -> Client {
        let (session, mut rx) = Session::new("g1", 64, None);
        self.dispatcher.sessions().register(&session).await;
        let connect = Message::Connect(SessionConnect {
            device_id: device.into(),
            ..Default::default()
        });
        self.dispatcher
            .dispatch(&session, Envelope::new("connect", connect))
            .await;
        assert!(matches!(rx.try_recv().unwrap().message, Message::Connect(_)));
        let player_id = session.player_id().unwrap().to_string();
        Client {
            session,
            rx,
            player_id,
        }
    }

    /// Dispatch one message and return the caller's reply.
    pub(crate) async fn request(&self, client: &mut Client, id: &str, message: Message) -> Envelope {
        self.dispatcher
            .dispatch(&client.session, Envelope::new(id, message))
            .await;
        client.rx.try_recv().unwrap()
    }

    /// Create a room owned by `client` and return its id.
    pub(crate) async fn create_room(&self, client: &mut Client, capacity: u32) -> String {
        let mut metadata = Metadata::new();
        metadata.insert("map".into(), "dunes".into());
        let reply = self
            .request(
                client,
                "create",
                Message::RoomCreate(RoomCreate {
                    name: "r1".into(),
                    max_players: capacity,
                    metadata,
                    ..Default::default()
                }),
            )
            .await;
        match reply.message {
            Message::RoomCreate(created) => created.room_id,
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Join `room_id` and discard the join reply.
    pub(crate) async fn join(&self, client: &mut Client, room_id: &str) {
        let reply = self
            .request(
                client,
                "join",
                Message::RoomJoin(RoomJoin {
                    room_id: room_id.into(),
                    ..Default::default()
                }),
            )
            .await;
        assert!(matches!(reply.message, Message::RoomJoin(ref j) if j.success));
    }
}

impl Client {
    /// Everything queued for this client so far.
    pub(crate) fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            out.push(envelope);
        }
        out
    }
}

pub(crate) fn error_code(envelope: &Envelope) -> Option<ErrorCode> {
    match &envelope.message {
        Message::Error(e) => Some(e.code),
        _ => None,
    }
}
