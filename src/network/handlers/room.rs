//! Room lifecycle handlers: create, join, leave and room messages.

use tracing::{debug, info};

use crate::network::dispatch::{Dispatcher, Request};
use crate::network::protocol::{
    ErrorCode, Message, PlayerJoined, RoomCreate, RoomJoin, RoomLeave, RoomMessage,
    RoomMessageEvent, RoomPlayer,
};
use crate::state::room::{CreateRoom, Room, RoomError, Visibility};

fn room_players(room: &Room) -> Vec<RoomPlayer> {
    room.members
        .values()
        .map(|m| RoomPlayer {
            player_id: m.player_id.clone(),
            is_ready: m.ready,
            metadata: m.metadata.clone(),
        })
        .collect()
}

impl Dispatcher {
    pub(crate) async fn handle_room_create(&self, req: &Request<'_>, create: RoomCreate) {
        let outcome = self
            .rooms
            .create_room(
                req.session.scope(),
                CreateRoom {
                    name: create.name,
                    game_type: create.game_type,
                    capacity: create.max_players,
                    visibility: Visibility::from_wire(create.is_private, &create.password),
                    owner_id: req.player_id.clone(),
                    owner_session_id: req.session.id().to_string(),
                    metadata: create.metadata,
                },
            )
            .await;

        let room = outcome.room;
        self.reply(
            req,
            Message::RoomCreate(RoomCreate {
                room_id: room.id.clone(),
                name: room.name.clone(),
                game_type: room.game_type.clone(),
                max_players: room.capacity,
                is_private: room.visibility.is_private(),
                password: String::new(),
                metadata: room.metadata.clone(),
                owner_id: room.owner_id.clone(),
            }),
        )
        .await;

        if let Some(departure) = &outcome.departed {
            self.fanout.departure(departure, "left").await;
        }
    }

    pub(crate) async fn handle_room_join(&self, req: &Request<'_>, join: RoomJoin) {
        if join.room_id.is_empty() {
            return self
                .reply_error(req, ErrorCode::InvalidPayload, "room_id is required")
                .await;
        }

        let password = (!join.password.is_empty()).then_some(join.password.as_str());
        let result = self
            .rooms
            .join_room(
                req.session.scope(),
                &join.room_id,
                &req.player_id,
                req.session.id(),
                password,
                join.metadata,
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(RoomError::NotFound(_)) => {
                return self
                    .reply_error(req, ErrorCode::RoomNotFound, "Room not found")
                    .await
            }
            Err(RoomError::InvalidPassword) => {
                return self
                    .reply_error(req, ErrorCode::InvalidPassword, "Invalid room password")
                    .await
            }
            Err(RoomError::Backend(e)) => return self.reply_backend_error(req, &e).await,
            Err(e) => {
                debug!(room_id = %join.room_id, error = %e, "join rejected");
                return self
                    .reply_error(req, ErrorCode::JoinFailed, "Failed to join room")
                    .await;
            }
        };

        let room = &outcome.room;
        self.reply(
            req,
            Message::RoomJoin(RoomJoin {
                room_id: room.id.clone(),
                success: true,
                metadata: room.metadata.clone(),
                players: room_players(room),
                owner_id: room.owner_id.clone(),
                ..Default::default()
            }),
        )
        .await;

        if outcome.already_member {
            return;
        }
        if let Some(departure) = &outcome.departed {
            self.fanout.departure(departure, "left").await;
        }

        self.fanout
            .to_others(
                &room.member_ids(),
                &req.player_id,
                Message::PlayerJoined(PlayerJoined {
                    room_id: room.id.clone(),
                    player_id: req.player_id.clone(),
                }),
            )
            .await;
        let replayed = self.fanout.room_snapshot(&req.player_id, &room.id).await;
        debug!(room_id = %room.id, player_id = %req.player_id, objects = replayed, "join snapshot sent");
    }

    pub(crate) async fn handle_room_leave(&self, req: &Request<'_>, leave: RoomLeave) {
        let Some(current) = self.rooms.player_room(&req.player_id).await else {
            return self
                .reply_error(req, ErrorCode::NotInRoom, "You are not in a room")
                .await;
        };
        if !leave.room_id.is_empty() && leave.room_id != current.id {
            return self
                .reply_error(req, ErrorCode::WrongRoom, "You are not in the specified room")
                .await;
        }

        let departure = match self
            .rooms
            .leave_room(req.session.scope(), &req.player_id)
            .await
        {
            Ok(departure) => departure,
            Err(e) => {
                debug!(player_id = %req.player_id, error = %e, "leave failed");
                return self
                    .reply_error(req, ErrorCode::LeaveFailed, "Failed to leave room")
                    .await;
            }
        };

        self.reply(
            req,
            Message::RoomLeave(RoomLeave {
                room_id: departure.room_id.clone(),
                success: true,
            }),
        )
        .await;
        self.fanout.departure(&departure, "left").await;
    }

    pub(crate) async fn handle_room_message(&self, req: &Request<'_>, message: RoomMessage) {
        let Some(current) = self.rooms.player_room(&req.player_id).await else {
            return self
                .reply_error(req, ErrorCode::NotInRoom, "You are not in a room")
                .await;
        };
        if !message.room_id.is_empty() && message.room_id != current.id {
            return self
                .reply_error(req, ErrorCode::WrongRoom, "You are not in the specified room")
                .await;
        }

        self.reply(
            req,
            Message::RoomMessage(RoomMessage {
                room_id: current.id.clone(),
                data: Vec::new(),
                success: true,
            }),
        )
        .await;

        let delivered = self
            .fanout
            .to_others(
                &current.member_ids(),
                &req.player_id,
                Message::RoomMessageEvent(RoomMessageEvent {
                    room_id: current.id.clone(),
                    sender_id: req.player_id.clone(),
                    data: message.data,
                }),
            )
            .await;
        info!(room_id = %current.id, sender = %req.player_id, delivered, "room message relayed");
    }
}

// =============================================================================
// TESTS
// =============================================================================
