//! SQLite-based datastore

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::Datastore;
use crate::models::{
    AccessGrant, EmailAddress, GrantEvent, GrantEventKind, GrantMetadata, IngestMetadata,
    IngestedMessage, MemberRole, MessageId, MessageStatuses, ProcessingStatus, Project, ProjectId,
    ProjectStatus, RevocationReason, TeamMember, TokenSet, User, UserId, normalize_address,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE users (
                id TEXT PRIMARY KEY,
                email TEXT,
                email_normalized TEXT,
                name TEXT
            );

            CREATE INDEX idx_users_email ON users(email_normalized);

            CREATE TABLE projects (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                monitoring_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE INDEX idx_projects_owner ON projects(owner_id, created_at ASC);

            -- Roster; the owner is never stored here
            CREATE TABLE team_members (
                project_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                role TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (project_id, id),
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            );

            -- Ingested messages; the id is the dedup key
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_json TEXT NOT NULL,
                to_json TEXT NOT NULL,
                cc_json TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                content_path TEXT NOT NULL,
                attachment_paths TEXT NOT NULL DEFAULT '[]',
                ingestion_status TEXT NOT NULL,
                analysis_status TEXT NOT NULL,
                assignment_status TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                ingested_at TEXT NOT NULL
            );

            CREATE INDEX idx_messages_project ON messages(project_id, sent_at ASC);

            -- One grant row per project
            CREATE TABLE grants (
                project_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                tokens TEXT,
                scopes TEXT NOT NULL DEFAULT '[]',
                connected INTEGER NOT NULL DEFAULT 0,
                granted_at TEXT NOT NULL,
                granted_by TEXT NOT NULL,
                last_refreshed_at TEXT,
                refresh_count INTEGER NOT NULL DEFAULT 0,
                reauthorization_required INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        ),
        // Migration 2: Grant audit trail
        M::up(
            r#"
            CREATE TABLE grant_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                at TEXT NOT NULL,
                actor TEXT NOT NULL,
                reason TEXT,
                details TEXT
            );

            CREATE INDEX idx_grant_events_project ON grant_events(project_id, id ASC);
            "#,
        ),
    ])
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", value))
}

fn parse_status(value: &str) -> Result<ProcessingStatus> {
    ProcessingStatus::parse(value).with_context(|| format!("Unknown status: {}", value))
}

/// Raw columns of a grants row
struct GrantRow {
    project_id: String,
    session_id: String,
    owner_id: String,
    tokens: Option<String>,
    scopes: String,
    connected: bool,
    granted_at: String,
    granted_by: String,
    last_refreshed_at: Option<String>,
    refresh_count: i64,
    reauthorization_required: bool,
    metadata: String,
}

impl GrantRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            session_id: row.get(1)?,
            owner_id: row.get(2)?,
            tokens: row.get(3)?,
            scopes: row.get(4)?,
            connected: row.get(5)?,
            granted_at: row.get(6)?,
            granted_by: row.get(7)?,
            last_refreshed_at: row.get(8)?,
            refresh_count: row.get(9)?,
            reauthorization_required: row.get(10)?,
            metadata: row.get(11)?,
        })
    }

    fn into_grant(self) -> Result<AccessGrant> {
        let tokens: Option<TokenSet> = self
            .tokens
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to decode grant tokens")?;
        let metadata: GrantMetadata =
            serde_json::from_str(&self.metadata).context("Failed to decode grant metadata")?;

        Ok(AccessGrant {
            project_id: ProjectId::new(self.project_id),
            session_id: self.session_id,
            owner_id: UserId::new(self.owner_id),
            tokens,
            scopes: serde_json::from_str(&self.scopes)?,
            connected: self.connected,
            granted_at: parse_ts(&self.granted_at)?,
            granted_by: UserId::new(self.granted_by),
            last_refreshed_at: self.last_refreshed_at.as_deref().map(parse_ts).transpose()?,
            refresh_count: self.refresh_count.max(0) as u32,
            reauthorization_required: self.reauthorization_required,
            metadata,
        })
    }
}

/// Raw columns of a messages row
struct MessageRow {
    id: String,
    project_id: String,
    owner_id: String,
    subject: String,
    from_json: String,
    to_json: String,
    cc_json: String,
    sent_at: String,
    content_path: String,
    attachment_paths: String,
    ingestion_status: String,
    analysis_status: String,
    assignment_status: String,
    metadata: String,
    ingested_at: String,
}

impl MessageRow {
    const COLUMNS: &'static str = "id, project_id, owner_id, subject, from_json, to_json, cc_json,
        sent_at, content_path, attachment_paths, ingestion_status, analysis_status,
        assignment_status, metadata, ingested_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            owner_id: row.get(2)?,
            subject: row.get(3)?,
            from_json: row.get(4)?,
            to_json: row.get(5)?,
            cc_json: row.get(6)?,
            sent_at: row.get(7)?,
            content_path: row.get(8)?,
            attachment_paths: row.get(9)?,
            ingestion_status: row.get(10)?,
            analysis_status: row.get(11)?,
            assignment_status: row.get(12)?,
            metadata: row.get(13)?,
            ingested_at: row.get(14)?,
        })
    }

    fn into_message(self) -> Result<IngestedMessage> {
        let from: EmailAddress = serde_json::from_str(&self.from_json)?;
        let to: Vec<EmailAddress> = serde_json::from_str(&self.to_json)?;
        let cc: Vec<EmailAddress> = serde_json::from_str(&self.cc_json)?;
        let metadata: IngestMetadata = serde_json::from_str(&self.metadata)?;

        Ok(IngestedMessage {
            id: MessageId::new(self.id),
            project_id: ProjectId::new(self.project_id),
            owner_id: UserId::new(self.owner_id),
            subject: self.subject,
            from,
            to,
            cc,
            sent_at: parse_ts(&self.sent_at)?,
            content_path: self.content_path,
            attachment_paths: serde_json::from_str(&self.attachment_paths)?,
            statuses: MessageStatuses {
                ingestion: parse_status(&self.ingestion_status)?,
                analysis: parse_status(&self.analysis_status)?,
                assignment: parse_status(&self.assignment_status)?,
            },
            metadata,
            ingested_at: parse_ts(&self.ingested_at)?,
        })
    }
}

/// SQLite-based datastore
pub struct SqliteDatastore {
    conn: Mutex<Connection>,
}

impl SqliteDatastore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed while a sync cycle writes; NORMAL
        // synchronous is safe with WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_roster(&self, conn: &Connection, project_id: &str) -> Result<Vec<TeamMember>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, email, role FROM team_members
             WHERE project_id = ? ORDER BY position",
        )?;

        let rows = stmt
            .query_map([project_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, name, email, role)| TeamMember {
                id,
                name,
                email,
                role: MemberRole::parse(&role),
                project_id: ProjectId::new(project_id),
            })
            .collect())
    }

    fn load_projects(
        &self,
        conn: &Connection,
        where_clause: &str,
        key: &str,
    ) -> Result<Vec<Project>> {
        let sql = format!(
            "SELECT id, owner_id, name, status, monitoring_enabled, created_at
             FROM projects WHERE {} ORDER BY created_at ASC, rowid ASC",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt
            .query_map([key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut projects = Vec::with_capacity(rows.len());
        for (id, owner_id, name, status, monitoring_enabled, created_at) in rows {
            let status = ProjectStatus::parse(&status)
                .with_context(|| format!("Unknown project status: {}", status))?;
            let roster = self.load_roster(conn, &id)?;
            projects.push(Project {
                id: ProjectId::new(id),
                owner_id: UserId::new(owner_id),
                name,
                status,
                monitoring_enabled,
                roster,
                created_at: parse_ts(&created_at)?,
            });
        }

        Ok(projects)
    }
}

impl Datastore for SqliteDatastore {
    fn upsert_user(&self, user: User) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, email, email_normalized, name) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                email_normalized = excluded.email_normalized,
                name = excluded.name",
            params![user.id.as_str(), user.email, user.normalized_email(), user.name],
        )?;
        Ok(())
    }

    fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT id, email, name FROM users WHERE id = ?",
                [id.as_str()],
                |row| {
                    Ok(User {
                        id: UserId::new(row.get::<_, String>(0)?),
                        email: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT id, email, name FROM users WHERE email_normalized = ? LIMIT 1",
                [normalize_address(email)],
                |row| {
                    Ok(User {
                        id: UserId::new(row.get::<_, String>(0)?),
                        email: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn upsert_project(&self, project: Project) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // ON CONFLICT DO UPDATE rather than INSERT OR REPLACE: a replace
        // deletes the row first and would cascade into the roster.
        tx.execute(
            "INSERT INTO projects (id, owner_id, name, status, monitoring_enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                status = excluded.status,
                monitoring_enabled = excluded.monitoring_enabled",
            params![
                project.id.as_str(),
                project.owner_id.as_str(),
                project.name,
                project.status.as_str(),
                project.monitoring_enabled,
                project.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM team_members WHERE project_id = ?",
            [project.id.as_str()],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO team_members (project_id, id, name, email, role, position)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for (i, member) in project.roster.iter().enumerate() {
                stmt.execute(params![
                    project.id.as_str(),
                    member.id,
                    member.name,
                    member.email,
                    member.role.as_str(),
                    i as i64
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let conn = self.conn.lock().unwrap();
        let mut projects = self.load_projects(&conn, "id = ?", id.as_str())?;
        Ok(projects.pop())
    }

    fn list_projects_for_owner(&self, owner_id: &UserId) -> Result<Vec<Project>> {
        let conn = self.conn.lock().unwrap();
        self.load_projects(&conn, "owner_id = ?", owner_id.as_str())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?)",
            [id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn insert_message(&self, message: IngestedMessage) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO messages (id, project_id, owner_id, subject, from_json, to_json, cc_json,
                sent_at, content_path, attachment_paths, ingestion_status, analysis_status,
                assignment_status, metadata, ingested_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
            params![
                message.id.as_str(),
                message.project_id.as_str(),
                message.owner_id.as_str(),
                message.subject,
                serde_json::to_string(&message.from)?,
                serde_json::to_string(&message.to)?,
                serde_json::to_string(&message.cc)?,
                message.sent_at.to_rfc3339(),
                message.content_path,
                serde_json::to_string(&message.attachment_paths)?,
                message.statuses.ingestion.as_str(),
                message.statuses.analysis.as_str(),
                message.statuses.assignment.as_str(),
                serde_json::to_string(&message.metadata)?,
                message.ingested_at.to_rfc3339(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<IngestedMessage>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM messages WHERE id = ?", MessageRow::COLUMNS);
        let row = conn
            .query_row(&sql, [id.as_str()], MessageRow::from_row)
            .optional()?;
        row.map(MessageRow::into_message).transpose()
    }

    fn update_message_statuses(&self, id: &MessageId, statuses: MessageStatuses) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE messages SET ingestion_status = ?, analysis_status = ?, assignment_status = ?
             WHERE id = ?",
            params![
                statuses.ingestion.as_str(),
                statuses.analysis.as_str(),
                statuses.assignment.as_str(),
                id.as_str()
            ],
        )?;
        if changed == 0 {
            bail!("Message {} not found", id);
        }
        Ok(())
    }

    fn list_messages_for_project(&self, project_id: &ProjectId) -> Result<Vec<IngestedMessage>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM messages WHERE project_id = ? ORDER BY sent_at ASC",
            MessageRow::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([project_id.as_str()], MessageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    fn get_grant(&self, project_id: &ProjectId) -> Result<Option<AccessGrant>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT project_id, session_id, owner_id, tokens, scopes, connected, granted_at,
                        granted_by, last_refreshed_at, refresh_count, reauthorization_required,
                        metadata
                 FROM grants WHERE project_id = ?",
                [project_id.as_str()],
                GrantRow::from_row,
            )
            .optional()?;
        row.map(GrantRow::into_grant).transpose()
    }

    fn upsert_grant(&self, grant: AccessGrant) -> Result<()> {
        let tokens = grant
            .tokens
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO grants (project_id, session_id, owner_id, tokens, scopes, connected,
                granted_at, granted_by, last_refreshed_at, refresh_count,
                reauthorization_required, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(project_id) DO UPDATE SET
                session_id = excluded.session_id,
                owner_id = excluded.owner_id,
                tokens = excluded.tokens,
                scopes = excluded.scopes,
                connected = excluded.connected,
                granted_at = excluded.granted_at,
                granted_by = excluded.granted_by,
                last_refreshed_at = excluded.last_refreshed_at,
                refresh_count = excluded.refresh_count,
                reauthorization_required = excluded.reauthorization_required,
                metadata = excluded.metadata",
            params![
                grant.project_id.as_str(),
                grant.session_id,
                grant.owner_id.as_str(),
                tokens,
                serde_json::to_string(&grant.scopes)?,
                grant.connected,
                grant.granted_at.to_rfc3339(),
                grant.granted_by.as_str(),
                grant.last_refreshed_at.map(|t| t.to_rfc3339()),
                grant.refresh_count as i64,
                grant.reauthorization_required,
                serde_json::to_string(&grant.metadata)?,
            ],
        )?;
        Ok(())
    }

    fn append_grant_event(&self, event: GrantEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO grant_events (project_id, session_id, kind, at, actor, reason, details)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                event.project_id.as_str(),
                event.session_id,
                event.kind.as_str(),
                event.at.to_rfc3339(),
                event.actor,
                event.reason.map(|r| r.as_str()),
                event.details,
            ],
        )?;
        Ok(())
    }

    fn list_grant_events(&self, project_id: &ProjectId) -> Result<Vec<GrantEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, kind, at, actor, reason, details
             FROM grant_events WHERE project_id = ? ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map([project_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(session_id, kind, at, actor, reason, details)| -> Result<GrantEvent> {
                Ok(GrantEvent {
                    project_id: project_id.clone(),
                    session_id,
                    kind: GrantEventKind::parse(&kind)
                        .with_context(|| format!("Unknown grant event kind: {}", kind))?,
                    at: parse_ts(&at)?,
                    actor,
                    reason: reason.as_deref().and_then(RevocationReason::parse),
                    details,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HistoryCursor, Revocation, SyncState};
    use chrono::Duration;
    use tempfile::tempdir;

    fn sample_message(id: &str, project: &str, age_hours: i64) -> IngestedMessage {
        IngestedMessage {
            id: MessageId::new(id),
            project_id: ProjectId::new(project),
            owner_id: UserId::new("u1"),
            subject: format!("Subject {}", id),
            from: EmailAddress::with_name("Carl", "carl@builders.com"),
            to: vec![EmailAddress::new("home@owner.com")],
            cc: vec![EmailAddress::new("arch@studio.com")],
            sent_at: Utc::now() - Duration::hours(age_hours),
            content_path: format!("emails/x/{}/content.json", id),
            attachment_paths: vec![format!("emails/x/{}/attachments/0_plan.pdf", id)],
            statuses: MessageStatuses::ingested(),
            metadata: IngestMetadata {
                thread_id: "t1".to_string(),
                label_ids: vec!["INBOX".to_string()],
                snippet: "hello".to_string(),
                history_id: Some("42".to_string()),
            },
            ingested_at: Utc::now(),
        }
    }

    fn sample_grant(project: &str) -> AccessGrant {
        AccessGrant {
            project_id: ProjectId::new(project),
            session_id: "sess-1".to_string(),
            owner_id: UserId::new("u1"),
            tokens: Some(TokenSet::new(
                "access",
                Some("refresh".to_string()),
                Some(Utc::now() + Duration::hours(1)),
            )),
            scopes: vec!["gmail.readonly".to_string()],
            connected: true,
            granted_at: Utc::now(),
            granted_by: UserId::new("u1"),
            last_refreshed_at: None,
            refresh_count: 0,
            reauthorization_required: false,
            metadata: GrantMetadata {
                last_processed_cursor: Some(SyncState::new(HistoryCursor::new("100"))),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_project_roster_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let store = SqliteDatastore::new(dir.path().join("foreman.db")).unwrap();
        let owner = UserId::new("u1");

        let project = Project::new("p1", owner.clone(), "Kitchen")
            .with_status(ProjectStatus::OnHold)
            .with_member("tm1", "Carl", "carl@builders.com", MemberRole::Contractor)
            .with_member("tm2", "Ann", "ann@studio.com", MemberRole::Architect);
        store.upsert_project(project).unwrap();

        let loaded = store.get_project(&ProjectId::new("p1")).unwrap().unwrap();
        assert_eq!(loaded.status, ProjectStatus::OnHold);
        assert_eq!(loaded.roster.len(), 2);
        assert_eq!(loaded.roster[0].email, "carl@builders.com");
        assert_eq!(loaded.roster[1].role, MemberRole::Architect);

        let owned = store.list_projects_for_owner(&owner).unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[test]
    fn test_insert_message_if_absent() {
        let store = SqliteDatastore::in_memory().unwrap();

        assert!(store.insert_message(sample_message("m1", "p1", 2)).unwrap());
        assert!(!store.insert_message(sample_message("m1", "p1", 2)).unwrap());
        assert!(store.has_message(&MessageId::new("m1")).unwrap());
        assert!(!store.has_message(&MessageId::new("m2")).unwrap());

        let loaded = store.get_message(&MessageId::new("m1")).unwrap().unwrap();
        assert_eq!(loaded.cc.len(), 1);
        assert_eq!(loaded.metadata.history_id.as_deref(), Some("42"));
        assert_eq!(loaded.statuses, MessageStatuses::ingested());
    }

    #[test]
    fn test_list_messages_ordered_by_sent_at() {
        let store = SqliteDatastore::in_memory().unwrap();
        store.insert_message(sample_message("new", "p1", 1)).unwrap();
        store.insert_message(sample_message("old", "p1", 5)).unwrap();
        store.insert_message(sample_message("other", "p2", 3)).unwrap();

        let listed = store
            .list_messages_for_project(&ProjectId::new("p1"))
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[test]
    fn test_grant_upsert_and_clear_tokens() {
        let store = SqliteDatastore::in_memory().unwrap();
        let project = ProjectId::new("p1");

        store.upsert_grant(sample_grant("p1")).unwrap();
        let loaded = store.get_grant(&project).unwrap().unwrap();
        assert!(loaded.is_active());
        assert_eq!(
            loaded
                .metadata
                .last_processed_cursor
                .map(|s| s.cursor.0),
            Some("100".to_string())
        );

        let mut revoked = sample_grant("p1");
        revoked.tokens = None;
        revoked.connected = false;
        revoked.metadata.revocation = Some(Revocation {
            at: Utc::now(),
            by: "u1".to_string(),
            reason: RevocationReason::UserRequest,
            details: None,
        });
        store.upsert_grant(revoked).unwrap();

        let loaded = store.get_grant(&project).unwrap().unwrap();
        assert!(loaded.tokens.is_none());
        assert!(!loaded.connected);
        assert_eq!(
            loaded.metadata.revocation.map(|r| r.reason),
            Some(RevocationReason::UserRequest)
        );
    }

    #[test]
    fn test_grant_events_in_order() {
        let store = SqliteDatastore::in_memory().unwrap();
        let project = ProjectId::new("p1");

        for (kind, reason) in [
            (GrantEventKind::Granted, None),
            (GrantEventKind::Revoked, Some(RevocationReason::Security)),
        ] {
            store
                .append_grant_event(GrantEvent {
                    project_id: project.clone(),
                    session_id: "sess-1".to_string(),
                    kind,
                    at: Utc::now(),
                    actor: "u1".to_string(),
                    reason,
                    details: None,
                })
                .unwrap();
        }

        let events = store.list_grant_events(&project).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, GrantEventKind::Granted);
        assert_eq!(events[1].reason, Some(RevocationReason::Security));
        assert!(store.list_grant_events(&ProjectId::new("p2")).unwrap().is_empty());
    }

    #[test]
    fn test_find_user_by_email() {
        let store = SqliteDatastore::in_memory().unwrap();
        store.upsert_user(User::new("u1", "Home@Owner.com")).unwrap();
        let found = store.find_user_by_email("home@owner.com").unwrap().unwrap();
        assert_eq!(found.id, UserId::new("u1"));
        assert_eq!(found.email.as_deref(), Some("Home@Owner.com"));
    }
}
