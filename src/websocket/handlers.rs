use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    app_state::AppState,
    config::BroadcastPolicy,
    error::AppResult,
    middlewares::auth::AuthUser,
    models::websocket::{ClientEvent, ServerEvent},
    websocket::manager::ConnectionId,
};

/// Frames read but not yet handled, per connection.
const INBOX_CAPACITY: usize = 64;

pub async fn websocket_handler(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, user.user_id))
}

/// One task reads frames into the inbox, one handles them in arrival order
/// and one drains the outbox to the socket.
async fn handle_websocket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Utf8Bytes>();
    let (inbox, mut inbox_rx) = mpsc::channel::<Utf8Bytes>(INBOX_CAPACITY);

    let connection_id = state.rooms.register(outbox);
    tracing::info!(%user_id, connection = %connection_id, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session = Session {
        state: state.clone(),
        user_id,
        connection_id,
    };
    let handler = tokio::spawn(async move {
        while let Some(frame) = inbox_rx.recv().await {
            session.handle_frame(frame.as_str()).await;
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if inbox.send(text).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(%user_id, connection = %connection_id, error = %e, "websocket read failed");
                break;
            }
            _ => {}
        }
    }

    // Leave every room now; frames already read are still handled and their
    // side effects still apply.
    state.rooms.unregister(connection_id);
    drop(inbox);
    let _ = handler.await;
    let _ = writer.await;

    tracing::info!(%user_id, connection = %connection_id, "websocket disconnected");
}

struct Session {
    state: AppState,
    user_id: Uuid,
    connection_id: ConnectionId,
}

impl Session {
    async fn handle_frame(&self, raw: &str) {
        let event = match serde_json::from_str::<ClientEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                let name = event_name(raw);
                tracing::warn!(actor = %self.user_id, event = name.as_deref().unwrap_or("unknown"), error = %e, "malformed realtime event");
                self.send(&ServerEvent::Exception {
                    status: "bad_request",
                    message: "Invalid event payload".to_string(),
                    event: name,
                });
                return;
            }
        };

        let name = event.name();
        let chat = event.chat_id();
        if let Err(e) = self.dispatch(event).await {
            if e.status().is_server_error() {
                tracing::error!(actor = %self.user_id, chat = ?chat, event = name, error = %e, "realtime handler failed");
            } else {
                tracing::warn!(actor = %self.user_id, chat = ?chat, event = name, error = %e, "realtime event rejected");
            }
            self.send(&ServerEvent::Exception {
                status: e.kind(),
                message: e.public_message(),
                event: Some(name.to_string()),
            });
        }
    }

    async fn dispatch(&self, event: ClientEvent) -> AppResult<()> {
        let state = &self.state;
        let user_id = self.user_id;

        match event {
            ClientEvent::Ping(payload) => {
                state.presence.mark_online(user_id).await;
                self.broadcast(payload.chat_id, &ServerEvent::UserOnline { user_id });
            }
            ClientEvent::Join(payload) => {
                state.membership.authorize(user_id, payload.chat_id).await?;
                state.rooms.join(self.connection_id, payload.chat_id);
                self.broadcast(payload.chat_id, &ServerEvent::UserJoined { user_id });
            }
            ClientEvent::Leave(payload) => {
                state.rooms.leave(self.connection_id, payload.chat_id);
                self.send(&ServerEvent::Left {
                    chat_id: payload.chat_id,
                });
            }
            ClientEvent::SendMessage(payload) => {
                payload.validate()?;
                state.membership.authorize(user_id, payload.chat_id).await?;
                let view = state
                    .history
                    .send_message(user_id, payload.chat_id, payload.text, payload.attachment_ref)
                    .await?;
                // The sender learns the minted id from this frame, so it always
                // goes to the whole room.
                state
                    .rooms
                    .broadcast(payload.chat_id, &ServerEvent::MessageSent(view), None);
            }
            ClientEvent::UpdateMessage(payload) => {
                payload.validate()?;
                let message = state.history.live_message(&payload.message_id).await?;
                state.membership.authorize(user_id, message.chat_id).await?;
                let updated = state
                    .history
                    .edit_message(user_id, &message, &payload.text)
                    .await?;
                self.broadcast(
                    message.chat_id,
                    &ServerEvent::MessageUpdated {
                        message_id: updated.id,
                        text: updated.text.unwrap_or_default(),
                    },
                );
            }
            ClientEvent::DeleteMessage(payload) => {
                payload.validate()?;
                let message = state.history.live_message(&payload.message_id).await?;
                state.membership.authorize(user_id, message.chat_id).await?;
                state.history.delete_message(user_id, &message).await?;
                self.broadcast(
                    message.chat_id,
                    &ServerEvent::MessageDeleted {
                        message_id: message.id,
                    },
                );
            }
            ClientEvent::ReadMessage(payload) => {
                payload.validate()?;
                state.membership.authorize(user_id, payload.chat_id).await?;
                let status = state
                    .history
                    .mark_read(user_id, payload.chat_id, &payload.last_seen_message_id)
                    .await?;
                self.broadcast(payload.chat_id, &ServerEvent::MessageSeen(status));
            }
            ClientEvent::CreatePoll(payload) => {
                payload.validate()?;
                state.membership.authorize(user_id, payload.chat_id).await?;
                let view = state
                    .history
                    .create_poll(user_id, payload.chat_id, &payload.title, payload.options)
                    .await?;
                self.broadcast(payload.chat_id, &ServerEvent::PollCreated(view));
            }
            ClientEvent::VotePoll(payload) => {
                state.membership.authorize(user_id, payload.chat_id).await?;
                let vote = state
                    .history
                    .vote_poll(user_id, payload.chat_id, payload.option_id)
                    .await?;
                self.broadcast(payload.chat_id, &ServerEvent::PollVoteReceived(vote));
            }
        }

        Ok(())
    }

    /// Room broadcast honouring the configured sender policy.
    fn broadcast(&self, chat_id: Uuid, event: &ServerEvent) {
        let exclude = match self.state.broadcast_policy {
            BroadcastPolicy::ExcludeSender => Some(self.connection_id),
            BroadcastPolicy::IncludeSender => None,
        };
        self.state.rooms.broadcast(chat_id, event, exclude);
    }

    fn send(&self, event: &ServerEvent) {
        self.state.rooms.send_to(self.connection_id, event);
    }
}

/// Best-effort read of the `event` field of a frame that failed to decode.
fn event_name(raw: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()?
        .get("event")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::Backends;
    use crate::config::Config;
    use crate::models::chats::ChatVisibility;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn state(policy: BroadcastPolicy) -> AppState {
        let mut config = Config::local("gateway-test-secret");
        config.broadcast_policy = policy;
        AppState::new(&config, Backends::in_memory())
    }

    fn session(state: &AppState, user_id: Uuid) -> (Session, UnboundedReceiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = state.rooms.register(tx);
        let session = Session {
            state: state.clone(),
            user_id,
            connection_id,
        };
        (session, rx)
    }

    fn frames(rx: &mut UnboundedReceiver<Utf8Bytes>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(frame.as_str()).unwrap());
        }
        out
    }

    async fn public_chat(state: &AppState) -> Uuid {
        state
            .membership
            .create_chat("general", ChatVisibility::Public, None)
            .await
            .unwrap()
            .id
    }

    async fn send(session: &Session, frame: Value) {
        session.handle_frame(&frame.to_string()).await;
    }

    #[tokio::test]
    async fn sent_messages_reach_the_whole_room_and_persist() {
        let state = state(BroadcastPolicy::ExcludeSender);
        let chat = public_chat(&state).await;
        let (alice, mut alice_rx) = session(&state, Uuid::new_v4());
        let (bob, mut bob_rx) = session(&state, Uuid::new_v4());

        send(&alice, json!({"event": "chat:join", "data": {"chatId": chat}})).await;
        send(&bob, json!({"event": "chat:join", "data": {"chatId": chat}})).await;
        frames(&mut alice_rx);
        frames(&mut bob_rx);

        send(
            &alice,
            json!({"event": "message:send", "data": {"chatId": chat, "text": "hello"}}),
        )
        .await;

        let to_alice = frames(&mut alice_rx);
        let to_bob = frames(&mut bob_rx);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0]["event"], "message:sent");
        assert_eq!(to_bob[0]["event"], "message:sent");
        assert_eq!(to_bob[0]["data"]["text"], "hello");
        assert_eq!(to_bob[0]["data"]["attachmentUrl"], Value::Null);

        let page = state.history.get_messages(chat, None, None).await.unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].message.id, to_bob[0]["data"]["id"]);
    }

    #[tokio::test]
    async fn exclude_sender_policy_skips_the_originating_connection() {
        let state = state(BroadcastPolicy::ExcludeSender);
        let chat = public_chat(&state).await;
        let (alice, mut alice_rx) = session(&state, Uuid::new_v4());
        let (bob, mut bob_rx) = session(&state, Uuid::new_v4());

        send(&bob, json!({"event": "chat:join", "data": {"chatId": chat}})).await;
        frames(&mut bob_rx);
        send(&alice, json!({"event": "chat:join", "data": {"chatId": chat}})).await;

        assert!(frames(&mut alice_rx).is_empty());
        let to_bob = frames(&mut bob_rx);
        assert_eq!(to_bob[0]["event"], "chat:join");
        assert_eq!(to_bob[0]["data"]["userId"], json!(alice.user_id));
    }

    #[tokio::test]
    async fn outsiders_of_private_chats_get_an_exception() {
        let state = state(BroadcastPolicy::IncludeSender);
        let chat = state
            .membership
            .create_chat("staff", ChatVisibility::Private, Some("letmein"))
            .await
            .unwrap()
            .id;
        let (mallory, mut mallory_rx) = session(&state, Uuid::new_v4());

        send(
            &mallory,
            json!({"event": "message:send", "data": {"chatId": chat, "text": "hi"}}),
        )
        .await;

        let replies = frames(&mut mallory_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["event"], "exception");
        assert_eq!(replies[0]["data"]["status"], "unauthorized");
        assert_eq!(replies[0]["data"]["message"], "Unauthorized");
        assert_eq!(replies[0]["data"]["event"], "message:send");
        assert!(state.history.get_messages(chat, None, None).await.unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_rejected_without_closing() {
        let state = state(BroadcastPolicy::IncludeSender);
        let chat = public_chat(&state).await;
        let (alice, mut alice_rx) = session(&state, Uuid::new_v4());

        alice.handle_frame(r#"{"event":"message:send","data":{"chatId":"nope"}}"#).await;
        let replies = frames(&mut alice_rx);
        assert_eq!(replies[0]["data"]["status"], "bad_request");
        assert_eq!(replies[0]["data"]["event"], "message:send");

        send(&alice, json!({"event": "chat:join", "data": {"chatId": chat}})).await;
        assert_eq!(frames(&mut alice_rx)[0]["event"], "chat:join");
    }

    #[tokio::test]
    async fn only_the_author_can_edit() {
        let state = state(BroadcastPolicy::IncludeSender);
        let chat = public_chat(&state).await;
        let (alice, mut alice_rx) = session(&state, Uuid::new_v4());
        let (bob, mut bob_rx) = session(&state, Uuid::new_v4());
        send(&alice, json!({"event": "chat:join", "data": {"chatId": chat}})).await;
        send(&bob, json!({"event": "chat:join", "data": {"chatId": chat}})).await;

        send(
            &alice,
            json!({"event": "message:send", "data": {"chatId": chat, "text": "draft"}}),
        )
        .await;
        let sent = frames(&mut alice_rx).pop().unwrap();
        let message_id = sent["data"]["id"].clone();
        frames(&mut bob_rx);

        send(
            &bob,
            json!({"event": "message:update", "data": {"messageId": message_id, "text": "hijacked"}}),
        )
        .await;
        assert_eq!(frames(&mut bob_rx)[0]["data"]["status"], "unauthorized");

        send(
            &alice,
            json!({"event": "message:update", "data": {"messageId": message_id, "text": "final"}}),
        )
        .await;
        let updated = frames(&mut bob_rx);
        assert_eq!(updated[0]["event"], "message:updated");
        assert_eq!(updated[0]["data"]["text"], "final");
    }

    async fn joined_pair(policy: BroadcastPolicy) -> (AppState, Uuid, [(Session, UnboundedReceiver<Utf8Bytes>); 2]) {
        let state = state(policy);
        let chat = public_chat(&state).await;
        let mut alice = session(&state, Uuid::new_v4());
        let mut bob = session(&state, Uuid::new_v4());
        send(&alice.0, json!({"event": "chat:join", "data": {"chatId": chat}})).await;
        send(&bob.0, json!({"event": "chat:join", "data": {"chatId": chat}})).await;
        frames(&mut alice.1);
        frames(&mut bob.1);
        (state, chat, [alice, bob])
    }

    #[tokio::test]
    async fn deleted_messages_are_announced_and_hidden() {
        let (state, chat, [(alice, mut alice_rx), (_bob, mut bob_rx)]) =
            joined_pair(BroadcastPolicy::IncludeSender).await;

        send(
            &alice,
            json!({"event": "message:send", "data": {"chatId": chat, "text": "oops"}}),
        )
        .await;
        let message_id = frames(&mut alice_rx)[0]["data"]["id"].clone();
        frames(&mut bob_rx);

        send(&alice, json!({"event": "message:delete", "data": {"messageId": message_id}})).await;
        let to_bob = frames(&mut bob_rx);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0]["event"], "message:deleted");
        assert_eq!(to_bob[0]["data"], json!({"messageId": message_id}));

        assert!(state.history.get_messages(chat, None, None).await.unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn read_receipts_carry_the_high_water_mark() {
        let (state, chat, [(alice, mut alice_rx), (bob, mut bob_rx)]) =
            joined_pair(BroadcastPolicy::IncludeSender).await;

        send(
            &alice,
            json!({"event": "message:send", "data": {"chatId": chat, "text": "read me"}}),
        )
        .await;
        let message_id = frames(&mut alice_rx)[0]["data"]["id"].clone();
        frames(&mut bob_rx);

        send(
            &bob,
            json!({"event": "message:read", "data": {"chatId": chat, "lastSeenMessageId": message_id}}),
        )
        .await;
        let seen = frames(&mut alice_rx);
        assert_eq!(seen[0]["event"], "message:seen");
        assert_eq!(seen[0]["data"]["userId"], json!(bob.user_id));
        assert_eq!(seen[0]["data"]["chatId"], json!(chat));
        assert_eq!(seen[0]["data"]["lastSeenMessageId"], message_id);

        let statuses = state.history.read_statuses(chat).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].user_id, bob.user_id);
    }

    #[tokio::test]
    async fn polls_are_created_and_voted_on() {
        let (_state, chat, [(alice, mut alice_rx), (bob, mut bob_rx)]) =
            joined_pair(BroadcastPolicy::IncludeSender).await;

        send(
            &alice,
            json!({"event": "poll:create", "data": {"chatId": chat, "title": "Lunch?", "options": ["tacos", "ramen"]}}),
        )
        .await;
        let created = frames(&mut bob_rx);
        assert_eq!(created[0]["event"], "poll:created");
        let poll = &created[0]["data"]["poll"];
        assert_eq!(poll["title"], "Lunch?");
        let options = poll["options"].as_array().unwrap();
        assert_eq!(options.len(), 2);
        assert_eq!(options[1]["text"], "ramen");
        assert!(options.iter().all(|o| o["id"].is_string()));
        frames(&mut alice_rx);

        let ramen = options[1]["id"].clone();
        send(&bob, json!({"event": "poll:vote", "data": {"chatId": chat, "optionId": ramen}})).await;
        let votes = frames(&mut alice_rx);
        assert_eq!(votes[0]["event"], "poll:receive:vote");
        assert_eq!(votes[0]["data"]["pollId"], poll["id"]);
        assert_eq!(votes[0]["data"]["optionId"], ramen);
        assert_eq!(votes[0]["data"]["userId"], json!(bob.user_id));
    }

    #[tokio::test]
    async fn poll_creation_follows_the_sender_policy() {
        let (_state, chat, [(alice, mut alice_rx), (_bob, mut bob_rx)]) =
            joined_pair(BroadcastPolicy::ExcludeSender).await;

        send(
            &alice,
            json!({"event": "poll:create", "data": {"chatId": chat, "title": "Ship it?", "options": ["yes", "no"]}}),
        )
        .await;
        assert!(frames(&mut alice_rx).is_empty());
        assert_eq!(frames(&mut bob_rx)[0]["event"], "poll:created");
    }

    #[tokio::test]
    async fn ping_announces_presence() {
        let (state, chat, [(alice, mut alice_rx), (_bob, mut bob_rx)]) =
            joined_pair(BroadcastPolicy::IncludeSender).await;

        send(&alice, json!({"event": "ping", "data": {"chatId": chat}})).await;
        let to_bob = frames(&mut bob_rx);
        assert_eq!(to_bob[0]["event"], "user:online");
        assert_eq!(to_bob[0]["data"], json!({"userId": alice.user_id}));
        assert_eq!(frames(&mut alice_rx)[0]["event"], "user:online");
        assert!(state.presence.is_online(alice.user_id).await);
    }

    #[tokio::test]
    async fn leaving_is_acknowledged_to_the_sender_only() {
        let (_state, chat, [(alice, mut alice_rx), (bob, mut bob_rx)]) =
            joined_pair(BroadcastPolicy::IncludeSender).await;

        send(&alice, json!({"event": "chat:leave", "data": {"chatId": chat}})).await;
        let to_alice = frames(&mut alice_rx);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0]["event"], "chat:leave");
        assert_eq!(to_alice[0]["data"], json!({"chatId": chat}));
        assert!(frames(&mut bob_rx).is_empty());

        send(
            &bob,
            json!({"event": "message:send", "data": {"chatId": chat, "text": "still here?"}}),
        )
        .await;
        assert!(frames(&mut alice_rx).is_empty());
    }

    #[test]
    fn event_name_is_recovered_from_bad_frames() {
        assert_eq!(
            event_name(r#"{"event":"message:send","data":{"chatId":"nope"}}"#).as_deref(),
            Some("message:send")
        );
        assert_eq!(event_name("not json"), None);
    }
}
