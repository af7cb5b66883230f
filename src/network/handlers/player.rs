//! Player profile and attribute handlers.
//!
//! All of these act on the bound player; the `player_id` field of the
//! request payload is ignored.

use tracing::info;

use crate::backend::Attribute;
use crate::network::dispatch::{Dispatcher, Request};
use crate::network::protocol::{
    DeletePlayerAttribute, ErrorCode, GetPlayerAttributes, Message, UpdatePlayer,
    UpdatePlayerAttributes,
};

impl Dispatcher {
    pub(crate) async fn handle_update_player(&self, req: &Request<'_>, update: UpdatePlayer) {
        let result = self
            .backend
            .update_player(
                req.session.scope(),
                &req.player_id,
                &update.display_name,
                &update.metadata,
            )
            .await;
        let profile = match result {
            Ok(profile) => profile,
            Err(e) => return self.reply_backend_error(req, &e).await,
        };

        info!(session_id = %req.session.id(), player_id = %req.player_id, "player updated");
        self.reply(
            req,
            Message::UpdatePlayer(UpdatePlayer {
                player_id: profile.player_id,
                display_name: profile.display_name,
                avatar_url: profile.avatar_url,
                metadata: profile.metadata,
            }),
        )
        .await;
    }

    pub(crate) async fn handle_update_attributes(
        &self,
        req: &Request<'_>,
        update: UpdatePlayerAttributes,
    ) {
        if update.collection.is_empty() || update.key.is_empty() {
            return self
                .reply_error(req, ErrorCode::InvalidPayload, "collection and key are required")
                .await;
        }

        let attribute = Attribute {
            player_id: req.player_id.clone(),
            collection: update.collection,
            key: update.key,
            value: update.value,
        };
        let stored = match self
            .backend
            .update_player_attribute(req.session.scope(), attribute)
            .await
        {
            Ok(stored) => stored,
            Err(e) => return self.reply_backend_error(req, &e).await,
        };

        info!(
            player_id = %req.player_id,
            collection = %stored.collection,
            key = %stored.key,
            "player attribute updated"
        );
        self.reply(
            req,
            Message::UpdatePlayerAttributes(UpdatePlayerAttributes {
                player_id: stored.player_id,
                collection: stored.collection,
                key: stored.key,
                value: stored.value,
            }),
        )
        .await;
    }

    pub(crate) async fn handle_get_attributes(&self, req: &Request<'_>, get: GetPlayerAttributes) {
        if get.collection.is_empty() {
            return self
                .reply_error(req, ErrorCode::InvalidPayload, "collection is required")
                .await;
        }

        let key = (!get.key.is_empty()).then_some(get.key.as_str());
        let set = match self
            .backend
            .get_player_attributes(req.session.scope(), &req.player_id, &get.collection, key)
            .await
        {
            Ok(set) => set,
            Err(e) => return self.reply_backend_error(req, &e).await,
        };

        self.reply(
            req,
            Message::GetPlayerAttributes(GetPlayerAttributes {
                player_id: set.player_id,
                collection: set.collection,
                key: set.key,
                value: set.value,
                attributes: set.attributes,
            }),
        )
        .await;
    }

    pub(crate) async fn handle_delete_attribute(
        &self,
        req: &Request<'_>,
        delete: DeletePlayerAttribute,
    ) {
        if delete.collection.is_empty() || delete.key.is_empty() {
            return self
                .reply_error(req, ErrorCode::InvalidPayload, "collection and key are required")
                .await;
        }

        if let Err(e) = self
            .backend
            .delete_player_attribute(
                req.session.scope(),
                &req.player_id,
                &delete.collection,
                &delete.key,
            )
            .await
        {
            return self.reply_backend_error(req, &e).await;
        }

        info!(player_id = %req.player_id, collection = %delete.collection, key = %delete.key, "player attribute deleted");
        self.reply(
            req,
            Message::DeletePlayerAttribute(DeletePlayerAttribute {
                player_id: req.player_id.clone(),
                collection: delete.collection,
                key: delete.key,
                success: true,
            }),
        )
        .await;
    }
}

// =============================================================================
// TESTS
// =============================================================================
