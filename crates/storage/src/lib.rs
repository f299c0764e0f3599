use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        ConversationId, ConversationKind, MembershipState, MessageId, MessageKind, PresenceStatus,
        Role, UserId,
    },
    protocol::MessagePayload,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub status: PresenceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub disabled: bool,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredConversationSummary {
    pub conversation: StoredConversation,
    pub role: Role,
    pub state: MembershipState,
    pub peer: Option<(UserId, String)>,
    pub last_message: Option<StoredMessage>,
    pub unread_count: u32,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub state: MembershipState,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn into_payload(self) -> MessagePayload {
        MessagePayload {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            content: self.content,
            kind: self.kind,
            reply_to_id: self.reply_to_id,
            sent_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
}

/// Where a history page ends. Pages are always returned oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCursor {
    Latest,
    BeforeId(MessageId),
    BeforeTime(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, u.display_name, m.content, m.kind, m.reply_to_id, m.created_at
     FROM messages m
     LEFT JOIN users u ON u.id = m.sender_id";

const CONVERSATION_COLUMNS: &str =
    "c.id, c.kind, c.name, c.description, c.created_by, c.created_at, c.last_activity_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every pooled connection to `sqlite::memory:` would open its own empty database.
        let pool = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(connect_options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(connect_options)
                .await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, display_name, status, last_seen_at, disabled FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn load_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, display_name, status, last_seen_at, disabled FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn set_user_disabled(&self, user_id: UserId, disabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET status = ?, last_seen_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(last_seen_at)
            .bind(user_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to store presence for user {}", user_id.0))?;
        Ok(())
    }

    /// Returns the existing private conversation between the two users when there is one.
    /// The boolean is true when a new conversation was created.
    pub async fn create_private_conversation(
        &self,
        creator: UserId,
        peer: UserId,
        now: DateTime<Utc>,
    ) -> Result<(ConversationId, bool)> {
        let key = private_key(creator, peer);
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE private_key = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(id) = existing {
            return Ok((ConversationId(id), false));
        }

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, private_key, created_by, created_at, last_activity_at)
             VALUES ('private', ?, ?, ?, ?) RETURNING id",
        )
        .bind(&key)
        .bind(creator.0)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        for (user_id, state) in [
            (creator, MembershipState::Accepted),
            (peer, MembershipState::Pending),
        ] {
            sqlx::query(
                "INSERT INTO memberships (conversation_id, user_id, role, state, joined_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(conversation_id.0)
            .bind(user_id.0)
            .bind(Role::Member.as_str())
            .bind(state.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok((conversation_id, true))
    }

    pub async fn create_group_conversation(
        &self,
        owner: UserId,
        name: &str,
        description: Option<&str>,
        member_ids: &[UserId],
        now: DateTime<Utc>,
    ) -> Result<ConversationId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, name, description, created_by, created_at, last_activity_at)
             VALUES ('group', ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(description)
        .bind(owner.0)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        sqlx::query(
            "INSERT INTO memberships (conversation_id, user_id, role, state, joined_at) VALUES (?, ?, 'owner', 'accepted', ?)",
        )
        .bind(conversation_id.0)
        .bind(owner.0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for member in member_ids.iter().filter(|id| **id != owner) {
            sqlx::query(
                "INSERT INTO memberships (conversation_id, user_id, role, state, joined_at)
                 VALUES (?, ?, 'member', 'pending', ?)
                 ON CONFLICT(conversation_id, user_id) DO NOTHING",
            )
            .bind(conversation_id.0)
            .bind(member.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(conversation_id)
    }

    pub async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?");
        let row = sqlx::query(&sql)
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    pub async fn update_group_settings(
        &self,
        conversation_id: ConversationId,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET name = COALESCE(?, name), description = COALESCE(?, description)
             WHERE id = ? AND kind = 'group'",
        )
        .bind(name)
        .bind(description)
        .bind(conversation_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_membership(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: Role,
        state: MembershipState,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO memberships (conversation_id, user_id, role, state, joined_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET role=excluded.role, state=excluded.state",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(state.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Adds pending invitations, leaving existing memberships untouched. Returns the invited ids.
    pub async fn invite_members(
        &self,
        conversation_id: ConversationId,
        member_ids: &[UserId],
    ) -> Result<Vec<UserId>> {
        let now = Utc::now();
        let mut invited = Vec::new();
        for member in member_ids {
            let result = sqlx::query(
                "INSERT INTO memberships (conversation_id, user_id, role, state, joined_at)
                 VALUES (?, ?, 'member', 'pending', ?)
                 ON CONFLICT(conversation_id, user_id) DO NOTHING",
            )
            .bind(conversation_id.0)
            .bind(member.0)
            .bind(now)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                invited.push(*member);
            }
        }
        Ok(invited)
    }

    pub async fn membership(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<(Role, MembershipState)>> {
        let row = sqlx::query(
            "SELECT role, state FROM memberships WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                role_from_str(&r.get::<String, _>(0)),
                state_from_str(&r.get::<String, _>(1)),
            )
        }))
    }

    pub async fn is_accepted_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        Ok(matches!(
            self.membership(conversation_id, user_id).await?,
            Some((_, MembershipState::Accepted))
        ))
    }

    pub async fn accept_membership(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE memberships SET state = 'accepted', joined_at = ?
             WHERE conversation_id = ? AND user_id = ? AND state = 'pending'",
        )
        .bind(Utc::now())
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_membership(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM memberships WHERE conversation_id = ? AND user_id = ?")
                .bind(conversation_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_member_role(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: Role,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE memberships SET role = ? WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(role.as_str())
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Members ordered by how long they have belonged to the conversation.
    pub async fn list_members(&self, conversation_id: ConversationId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username, u.display_name, m.role, m.state, m.joined_at
             FROM memberships m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.conversation_id = ?
             ORDER BY julianday(m.joined_at) ASC, u.id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMember {
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
                display_name: r.get::<String, _>(2),
                role: role_from_str(&r.get::<String, _>(3)),
                state: state_from_str(&r.get::<String, _>(4)),
                joined_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    pub async fn accepted_member_ids(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM memberships WHERE conversation_id = ? AND state = 'accepted'",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(UserId).collect())
    }

    /// Persists the message and the conversation's last activity in one transaction.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<StoredMessage> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, content, kind, reply_to_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(message.conversation_id.0)
        .bind(message.sender_id.0)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.reply_to_id.map(|id| id.0))
        .bind(message.sent_at)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert message")?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        sqlx::query("UPDATE conversations SET last_activity_at = ? WHERE id = ?")
            .bind(message.sent_at)
            .bind(message.conversation_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to update conversation activity")?;

        let sender_name: Option<String> =
            sqlx::query_scalar("SELECT display_name FROM users WHERE id = ?")
                .bind(message.sender_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        Ok(StoredMessage {
            message_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name,
            content: message.content.clone(),
            kind: message.kind,
            reply_to_id: message.reply_to_id,
            created_at: message.sent_at,
        })
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| message_from_row(&r)))
    }

    /// Fetches `limit` messages older than the cursor. One extra row is read to
    /// decide `has_more` without a second query.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        cursor: HistoryCursor,
    ) -> Result<StoredPage> {
        let fetch = i64::from(limit) + 1;
        let mut rows = match cursor {
            HistoryCursor::Latest => {
                let sql = format!(
                    "{MESSAGE_SELECT} WHERE m.conversation_id = ? ORDER BY m.id DESC LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(conversation_id.0)
                    .bind(fetch)
                    .fetch_all(&self.pool)
                    .await?
            }
            HistoryCursor::BeforeId(before_id) => {
                let sql = format!(
                    "{MESSAGE_SELECT} WHERE m.conversation_id = ? AND m.id < ? ORDER BY m.id DESC LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(conversation_id.0)
                    .bind(before_id.0)
                    .bind(fetch)
                    .fetch_all(&self.pool)
                    .await?
            }
            HistoryCursor::BeforeTime(before) => {
                let sql = format!(
                    "{MESSAGE_SELECT} WHERE m.conversation_id = ? AND julianday(m.created_at) < julianday(?) ORDER BY m.id DESC LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(conversation_id.0)
                    .bind(before)
                    .bind(fetch)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        rows.reverse();
        Ok(StoredPage {
            messages: rows.iter().map(message_from_row).collect(),
            has_more,
        })
    }

    /// Accepted conversations, most recent activity first.
    pub async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversationSummary>> {
        self.list_conversations_in_state(user_id, MembershipState::Accepted)
            .await
    }

    pub async fn list_pending_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversationSummary>> {
        self.list_conversations_in_state(user_id, MembershipState::Pending)
            .await
    }

    async fn list_conversations_in_state(
        &self,
        user_id: UserId,
        state: MembershipState,
    ) -> Result<Vec<StoredConversationSummary>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS}, m.role, m.state,
                (SELECT MAX(id) FROM messages WHERE conversation_id = c.id) AS last_message_id,
                (SELECT COUNT(*) FROM messages msg
                  WHERE msg.conversation_id = c.id
                    AND msg.sender_id != ?1
                    AND msg.id > COALESCE(
                        (SELECT rc.last_read_message_id FROM read_cursors rc
                          WHERE rc.conversation_id = c.id AND rc.user_id = ?1), 0)
                ) AS unread_count,
                (SELECT pm.user_id FROM memberships pm
                  WHERE pm.conversation_id = c.id AND pm.user_id != ?1 LIMIT 1) AS peer_id,
                (SELECT pu.display_name FROM memberships pm INNER JOIN users pu ON pu.id = pm.user_id
                  WHERE pm.conversation_id = c.id AND pm.user_id != ?1 LIMIT 1) AS peer_name
             FROM conversations c
             INNER JOIN memberships m ON m.conversation_id = c.id
             WHERE m.user_id = ?1 AND m.state = ?2
             ORDER BY julianday(c.last_activity_at) DESC, c.id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.0)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for r in rows {
            let conversation = conversation_from_row(&r);
            let last_message = match r.get::<Option<i64>, _>("last_message_id") {
                Some(id) => self.load_message(MessageId(id)).await?,
                None => None,
            };
            let peer = match conversation.kind {
                ConversationKind::Private => r
                    .get::<Option<i64>, _>("peer_id")
                    .zip(r.get::<Option<String>, _>("peer_name"))
                    .map(|(id, name)| (UserId(id), name)),
                ConversationKind::Group => None,
            };
            summaries.push(StoredConversationSummary {
                conversation,
                role: role_from_str(&r.get::<String, _>("role")),
                state: state_from_str(&r.get::<String, _>("state")),
                peer,
                last_message,
                unread_count: u32::try_from(r.get::<i64, _>("unread_count")).unwrap_or(u32::MAX),
            });
        }
        Ok(summaries)
    }

    pub async fn read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<MessageId>> {
        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT last_read_message_id FROM read_cursors WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor.map(MessageId))
    }

    /// Monotonic upsert: a lower id never replaces a higher one. Returns the stored cursor.
    pub async fn advance_read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
        read_at: DateTime<Utc>,
    ) -> Result<MessageId> {
        let stored: i64 = sqlx::query_scalar(
            "INSERT INTO read_cursors (conversation_id, user_id, last_read_message_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                updated_at = CASE
                    WHEN excluded.last_read_message_id > read_cursors.last_read_message_id
                    THEN excluded.updated_at ELSE read_cursors.updated_at END,
                last_read_message_id = MAX(read_cursors.last_read_message_id, excluded.last_read_message_id)
             RETURNING last_read_message_id",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(message_id.0)
        .bind(read_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to store read cursor")?;
        Ok(MessageId(stored))
    }
}

fn private_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    format!("{}:{}", low.0, high.0)
}

fn user_from_row(r: &SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        display_name: r.get::<String, _>(2),
        status: r
            .get::<String, _>(3)
            .parse()
            .unwrap_or(PresenceStatus::Offline),
        last_seen_at: r.get::<Option<DateTime<Utc>>, _>(4),
        disabled: r.get::<bool, _>(5),
    }
}

fn conversation_from_row(r: &SqliteRow) -> StoredConversation {
    StoredConversation {
        conversation_id: ConversationId(r.get::<i64, _>(0)),
        kind: match r.get::<String, _>(1).as_str() {
            "group" => ConversationKind::Group,
            _ => ConversationKind::Private,
        },
        name: r.get::<Option<String>, _>(2),
        description: r.get::<Option<String>, _>(3),
        created_by: UserId(r.get::<i64, _>(4)),
        created_at: r.get::<DateTime<Utc>, _>(5),
        last_activity_at: r.get::<DateTime<Utc>, _>(6),
    }
}

fn message_from_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        conversation_id: ConversationId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_name: r.get::<Option<String>, _>(3),
        content: r.get::<String, _>(4),
        kind: match r.get::<String, _>(5).as_str() {
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        },
        reply_to_id: r.get::<Option<i64>, _>(6).map(MessageId),
        created_at: r.get::<DateTime<Utc>, _>(7),
    }
}

fn role_from_str(raw: &str) -> Role {
    match raw {
        "owner" => Role::Owner,
        "admin" => Role::Admin,
        _ => Role::Member,
    }
}

fn state_from_str(raw: &str) -> MembershipState {
    match raw {
        "accepted" => MembershipState::Accepted,
        _ => MembershipState::Pending,
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
