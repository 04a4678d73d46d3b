use std::collections::HashMap;

use uuid::Uuid;

use crate::error::AppResult;
use crate::models::messages::{Poll, PollOption, PollOptionRef, PollVote, PollVoter};
use crate::queries::db_error;

#[derive(sqlx::FromRow)]
struct PollRow {
    id: Uuid,
    message_id: String,
    title: String,
}

#[derive(sqlx::FromRow)]
struct OptionRow {
    id: Uuid,
    poll_id: Uuid,
    text: String,
}

#[derive(sqlx::FromRow)]
struct VoteRow {
    option_id: Uuid,
    user_id: Uuid,
}

pub async fn insert_poll(
    conn: &mut sqlx::PgConnection,
    poll_id: Uuid,
    message_id: &str,
    title: &str,
) -> AppResult<()> {
    sqlx::query("INSERT INTO polls (id, message_id, title) VALUES ($1, $2, $3)")
        .bind(poll_id)
        .bind(message_id)
        .bind(title)
        .execute(conn)
        .await
        .map_err(db_error("Failed to create poll"))?;

    Ok(())
}

pub async fn insert_poll_option(
    conn: &mut sqlx::PgConnection,
    poll_id: Uuid,
    text: &str,
    position: i32,
) -> AppResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO poll_options (id, poll_id, text, position) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(poll_id)
        .bind(text)
        .bind(position)
        .execute(conn)
        .await
        .map_err(db_error("Failed to create poll option"))?;

    Ok(id)
}

/// Polls attached to the given messages, keyed by message id.
pub async fn load_polls(
    conn: &mut sqlx::PgConnection,
    message_ids: &[String],
) -> AppResult<HashMap<String, Poll>> {
    if message_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let polls = sqlx::query_as::<_, PollRow>(
        "SELECT id, message_id, title FROM polls WHERE message_id = ANY($1)",
    )
    .bind(message_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load polls"))?;

    if polls.is_empty() {
        return Ok(HashMap::new());
    }

    let poll_ids: Vec<Uuid> = polls.iter().map(|p| p.id).collect();

    let options = sqlx::query_as::<_, OptionRow>(
        "SELECT id, poll_id, text FROM poll_options
         WHERE poll_id = ANY($1)
         ORDER BY position ASC",
    )
    .bind(&poll_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load poll options"))?;

    let votes = sqlx::query_as::<_, VoteRow>(
        "SELECT option_id, user_id FROM poll_votes
         WHERE poll_id = ANY($1)
         ORDER BY created_at ASC",
    )
    .bind(&poll_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load poll votes"))?;

    let mut voters: HashMap<Uuid, Vec<PollVoter>> = HashMap::new();
    for vote in votes {
        voters.entry(vote.option_id).or_default().push(PollVoter {
            user_id: vote.user_id,
        });
    }

    let mut options_by_poll: HashMap<Uuid, Vec<PollOption>> = HashMap::new();
    for option in options {
        options_by_poll
            .entry(option.poll_id)
            .or_default()
            .push(PollOption {
                id: option.id,
                text: option.text,
                votes: voters.remove(&option.id).unwrap_or_default(),
            });
    }

    Ok(polls
        .into_iter()
        .map(|poll| {
            let options = options_by_poll.remove(&poll.id).unwrap_or_default();
            (
                poll.message_id,
                Poll {
                    id: poll.id,
                    title: poll.title,
                    options,
                },
            )
        })
        .collect())
}

pub async fn find_poll_option(
    conn: &mut sqlx::PgConnection,
    option_id: Uuid,
) -> AppResult<Option<PollOptionRef>> {
    sqlx::query_as::<_, PollOptionRef>(
        "SELECT o.id AS option_id, o.poll_id, m.chat_id
         FROM poll_options AS o
         JOIN polls AS p ON p.id = o.poll_id
         JOIN messages AS m ON m.id = p.message_id
         WHERE o.id = $1 AND m.deleted_at IS NULL",
    )
    .bind(option_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to load poll option"))
}

/// One vote per user per poll; voting again moves the vote to the new option.
pub async fn upsert_vote(
    conn: &mut sqlx::PgConnection,
    user_id: Uuid,
    option: &PollOptionRef,
) -> AppResult<PollVote> {
    sqlx::query_as::<_, PollVote>(
        "INSERT INTO poll_votes (id, poll_id, option_id, user_id)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (poll_id, user_id)
         DO UPDATE SET option_id = EXCLUDED.option_id, created_at = now()
         RETURNING id, poll_id, option_id, user_id, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(option.poll_id)
    .bind(option.option_id)
    .bind(user_id)
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to record vote"))
}
