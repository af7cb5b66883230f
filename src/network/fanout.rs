//! Fan-out
//!
//! Delivers one logical event to many players. Each recipient is
//! independent: a player who is not connected is skipped.

use std::sync::Arc;

use tracing::debug;

use crate::network::protocol::{Envelope, Message, ObjectDestroy, PlayerLeft};
use crate::network::session::{SendError, SessionRegistry};
use crate::state::objects::ObjectRegistry;
use crate::state::room::{Departure, Room};

/// Player-addressed delivery.
#[derive(Clone)]
pub struct Fanout {
    sessions: Arc<SessionRegistry>,
    objects: Arc<ObjectRegistry>,
}

impl Fanout {
    /// Fan-out over the given registries.
    pub fn new(sessions: Arc<SessionRegistry>, objects: Arc<ObjectRegistry>) -> Self {
        Self { sessions, objects }
    }

    /// Send to one player.
    pub async fn to_player(&self, player_id: &str, message: Message) -> Result<(), SendError> {
        self.sessions
            .send_to_player(player_id, Envelope::push(message))
            .await
    }

    /// Send to every listed player. Returns how many were reached.
    pub async fn to_players(&self, recipients: &[String], message: Message) -> usize {
        if recipients.is_empty() {
            return 0;
        }
        self.sessions
            .send_to_players(recipients, &Envelope::push(message))
            .await
    }

    /// Send to every listed player except `skip`.
    pub async fn to_others(&self, recipients: &[String], skip: &str, message: Message) -> usize {
        let others: Vec<String> = recipients
            .iter()
            .filter(|id| id.as_str() != skip)
            .cloned()
            .collect();
        self.to_players(&others, message).await
    }

    /// Replay every object in a room to one player.
    pub async fn room_snapshot(&self, player_id: &str, room_id: &str) -> usize {
        let mut sent = 0;
        for object in self.objects.room_objects(room_id).await {
            if self
                .to_player(player_id, Message::ObjectInstantiate(object.to_instantiate()))
                .await
                .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    /// Tell the rest of a room that someone left, and destroy what they owned there.
    ///
    /// A deleted room has all its objects purged instead.
    pub async fn departure(&self, departure: &Departure, reason: &str) {
        if departure.room_deleted {
            let purged = self.objects.cleanup_room(&departure.room_id).await;
            debug!(room_id = %departure.room_id, purged = purged.len(), "room emptied");
            return;
        }

        let released = self
            .objects
            .release_player_room(&departure.player_id, &departure.room_id)
            .await;
        for object in released {
            self.to_players(
                &departure.remaining,
                Message::ObjectDestroy(ObjectDestroy {
                    view_id: object.view_id,
                    success: true,
                }),
            )
            .await;
        }

        self.to_players(
            &departure.remaining,
            Message::PlayerLeft(PlayerLeft {
                room_id: departure.room_id.clone(),
                player_id: departure.player_id.clone(),
                new_owner_id: departure.new_owner.clone().unwrap_or_default(),
                reason: reason.to_string(),
            }),
        )
        .await;
    }

    /// Purge a deleted room's objects and tell every former member.
    ///
    /// Each member receives one `object_destroy` per purged object, then a
    /// `player_left` naming themselves.
    pub async fn room_closed(&self, room: &Room, reason: &str) -> usize {
        let members = room.member_ids();
        let purged = self.objects.cleanup_room(&room.id).await;
        for object in &purged {
            self.to_players(
                &members,
                Message::ObjectDestroy(ObjectDestroy {
                    view_id: object.view_id,
                    success: true,
                }),
            )
            .await;
        }
        for member in &members {
            let left = Message::PlayerLeft(PlayerLeft {
                room_id: room.id.clone(),
                player_id: member.clone(),
                new_owner_id: String::new(),
                reason: reason.to_string(),
            });
            if let Err(e) = self.to_player(member, left).await {
                debug!(player_id = %member, error = %e, "room close notice dropped");
            }
        }
        debug!(room_id = %room.id, purged = purged.len(), "room closed");
        purged.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
