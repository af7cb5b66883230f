//! Matchmaker ticket handlers.

use tracing::info;

use crate::backend::TicketRequest;
use crate::network::dispatch::{Dispatcher, Request};
use crate::network::protocol::{ErrorCode, MatchmakerAdd, MatchmakerRemove, Message, Metadata, Status};

fn status(key: &str, ticket: String) -> Message {
    let mut presence_statuses = Metadata::new();
    presence_statuses.insert(key.to_string(), ticket);
    Message::Status(Status { presence_statuses })
}

impl Dispatcher {
    pub(crate) async fn handle_matchmaker_add(&self, req: &Request<'_>, add: MatchmakerAdd) {
        if add.max_count > 0 && add.min_count > add.max_count {
            return self
                .reply_error(req, ErrorCode::InvalidPayload, "min_count exceeds max_count")
                .await;
        }

        let request = TicketRequest {
            player_id: req.player_id.clone(),
            query: add.query,
            min_count: add.min_count,
            max_count: add.max_count,
            string_properties: add.string_properties,
            numeric_properties: add.numeric_properties,
        };
        let ticket = match self.backend.create_ticket(req.session.scope(), request).await {
            Ok(ticket) => ticket,
            Err(e) => return self.reply_backend_error(req, &e).await,
        };

        info!(player_id = %req.player_id, ticket = %ticket, "matchmaker ticket created");
        self.reply(req, status("ticket_created", ticket)).await;
    }

    pub(crate) async fn handle_matchmaker_remove(&self, req: &Request<'_>, remove: MatchmakerRemove) {
        if remove.ticket.is_empty() {
            return self
                .reply_error(req, ErrorCode::InvalidPayload, "ticket is required")
                .await;
        }

        if let Err(e) = self
            .backend
            .delete_ticket(req.session.scope(), &req.player_id, &remove.ticket)
            .await
        {
            return self.reply_backend_error(req, &e).await;
        }

        info!(player_id = %req.player_id, ticket = %remove.ticket, "matchmaker ticket removed");
        self.reply(req, status("ticket_removed", remove.ticket)).await;
    }
}

// =============================================================================
// TESTS
// =============================================================================
