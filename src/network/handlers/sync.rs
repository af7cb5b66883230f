//! Object replication handlers.
//!
//! Only the owning player may mutate or destroy an object. Objects with no
//! owner belong to the backend and are read-only for every client.

use tracing::debug;

use crate::network::dispatch::{Dispatcher, Request};
use crate::network::protocol::{
    ErrorCode, Message, ObjectDestroy, ObjectInstantiate, ObjectSync, ObjectSyncAck,
};
use crate::state::objects::{NetworkObject, Transform, ViewId};

impl Dispatcher {
    pub(crate) async fn handle_object_instantiate(
        &self,
        req: &Request<'_>,
        instantiate: ObjectInstantiate,
    ) {
        let Some(room) = self.rooms.player_room(&req.player_id).await else {
            return self
                .reply_error(
                    req,
                    ErrorCode::NotInRoom,
                    "You must be in a room to instantiate objects",
                )
                .await;
        };

        let object = self
            .objects
            .create_object(
                &req.player_id,
                &room.id,
                &instantiate.prefab_name,
                Transform {
                    position: instantiate.position,
                    rotation: instantiate.rotation,
                    scale: instantiate.scale,
                },
                instantiate.properties,
            )
            .await;

        let wire = object.to_instantiate();
        self.reply(req, Message::ObjectInstantiate(wire.clone())).await;
        self.fanout
            .to_others(&room.member_ids(), &req.player_id, Message::ObjectInstantiate(wire))
            .await;
    }

    pub(crate) async fn handle_object_sync(&self, req: &Request<'_>, sync: ObjectSync) {
        let Some(object) = self.owned_object(req, sync.view_id).await else {
            return;
        };

        let transform = Transform {
            position: sync.position,
            rotation: sync.rotation,
            scale: sync.scale,
        };
        if !transform.is_empty() {
            if let Err(e) = self.objects.update_transform(object.view_id, transform).await {
                debug!(error = %e, "object vanished during sync");
                return self
                    .reply_error(req, ErrorCode::ObjectNotFound, "Object not found")
                    .await;
            }
        }
        if !sync.properties.is_empty() {
            if let Err(e) = self
                .objects
                .update_properties(object.view_id, sync.properties.clone())
                .await
            {
                debug!(error = %e, "object vanished during sync");
                return self
                    .reply_error(req, ErrorCode::ObjectNotFound, "Object not found")
                    .await;
            }
        }

        self.reply(
            req,
            Message::ObjectSyncAck(ObjectSyncAck {
                view_id: object.view_id,
                success: true,
            }),
        )
        .await;

        let members = self.rooms.players_in_room(&object.room_id).await;
        self.fanout
            .to_others(&members, &req.player_id, Message::ObjectSync(sync))
            .await;
    }

    pub(crate) async fn handle_object_destroy(&self, req: &Request<'_>, destroy: ObjectDestroy) {
        let Some(object) = self.owned_object(req, destroy.view_id).await else {
            return;
        };

        let Some(room_id) = self.objects.delete_object(object.view_id).await else {
            return self
                .reply_error(req, ErrorCode::DestroyFailed, "Failed to destroy object")
                .await;
        };

        let event = ObjectDestroy {
            view_id: object.view_id,
            success: true,
        };
        self.reply(req, Message::ObjectDestroy(event.clone())).await;

        let members = self.rooms.players_in_room(&room_id).await;
        self.fanout
            .to_others(&members, &req.player_id, Message::ObjectDestroy(event))
            .await;
    }

    /// Look up an object and check the caller owns it, replying on failure.
    async fn owned_object(&self, req: &Request<'_>, view_id: ViewId) -> Option<NetworkObject> {
        let Some(object) = self.objects.get(view_id).await else {
            self.reply_error(req, ErrorCode::ObjectNotFound, "Object not found")
                .await;
            return None;
        };
        if object.owner_id != req.player_id {
            self.reply_error(req, ErrorCode::NotOwner, "You don't own this object")
                .await;
            return None;
        }
        Some(object)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::testing::{error_code, Client, Harness};
    use crate::network::protocol::{
        ErrorCode, Message, ObjectDestroy, ObjectInstantiate, ObjectSync, Vector3,
    };

    async fn spawn_ball(h: &Harness, owner: &mut Client) -> u64 {
        let reply = h
            .request(
                owner,
                "spawn",
                Message::ObjectInstantiate(ObjectInstantiate {
                    prefab_name: "ball".into(),
                    position: Some(Vector3 { x: 1.0, y: 0.0, z: 0.0 }),
                    ..Default::default()
                }),
            )
            .await;
        match reply.message {
            Message::ObjectInstantiate(obj) => obj.view_id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_instantiate_outside_room() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let reply = h
            .request(&mut a, "1", Message::ObjectInstantiate(ObjectInstantiate::default()))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotInRoom));
        assert_eq!(h.objects.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_instantiate_reaches_peers() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        a.drain();
        b.drain();

        let view_id = spawn_ball(&h, &mut a).await;
        let events = b.drain();
        assert_eq!(events.len(), 1);
        match &events[0].message {
            Message::ObjectInstantiate(obj) => {
                assert_eq!(obj.view_id, view_id);
                assert_eq!(obj.owner_id, a.player_id);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_non_owner_sync_rejected() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        a.drain();
        let view_id = spawn_ball(&h, &mut a).await;
        b.drain();

        let reply = h
            .request(
                &mut b,
                "s",
                Message::ObjectSync(ObjectSync {
                    view_id,
                    position: Some(Vector3 { x: 9.0, y: 9.0, z: 9.0 }),
                    ..Default::default()
                }),
            )
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotOwner));

        let object = h.objects.get(view_id).await.unwrap();
        assert_eq!(object.position, Some(Vector3 { x: 1.0, y: 0.0, z: 0.0 }));
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_non_owner_destroy_rejected() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        a.drain();
        let view_id = spawn_ball(&h, &mut a).await;
        b.drain();

        let reply = h
            .request(
                &mut b,
                "d",
                Message::ObjectDestroy(ObjectDestroy {
                    view_id,
                    ..Default::default()
                }),
            )
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotOwner));
        assert!(h.objects.get(view_id).await.is_some());
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_owner_sync_acked_and_relayed() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        a.drain();
        let view_id = spawn_ball(&h, &mut a).await;
        b.drain();

        let moved = Vector3 { x: 2.0, y: 3.0, z: 4.0 };
        let reply = h
            .request(
                &mut a,
                "s",
                Message::ObjectSync(ObjectSync {
                    view_id,
                    position: Some(moved),
                    ..Default::default()
                }),
            )
            .await;
        match reply.message {
            Message::ObjectSyncAck(ack) => {
                assert_eq!(ack.view_id, view_id);
                assert!(ack.success);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.objects.get(view_id).await.unwrap().position, Some(moved));

        let events = b.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].message, Message::ObjectSync(ref s) if s.view_id == view_id));
    }

    #[tokio::test]
    async fn test_owner_destroy_relayed() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        a.drain();
        let view_id = spawn_ball(&h, &mut a).await;
        b.drain();

        let reply = h
            .request(
                &mut a,
                "d",
                Message::ObjectDestroy(ObjectDestroy {
                    view_id,
                    ..Default::default()
                }),
            )
            .await;
        assert!(matches!(reply.message, Message::ObjectDestroy(ref d) if d.success));
        assert_eq!(h.objects.object_count().await, 0);

        let events = b.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].message, Message::ObjectDestroy(ref d) if d.view_id == view_id));
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let reply = h
            .request(
                &mut a,
                "s",
                Message::ObjectSync(ObjectSync {
                    view_id: 404,
                    ..Default::default()
                }),
            )
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::ObjectNotFound));
    }
}
