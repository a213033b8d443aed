//! Multipart session rows. The signed token is the authority during an
//! upload; these rows only exist so completion can be audited and so the
//! sweeper can find sessions whose clients vanished.

use std::str::FromStr;

use common::{
    runtime::UnixTimestamp,
    types::SessionId,
};
use rusqlite::{
    params,
    Row,
};

use crate::{
    types::MultipartSession,
    Database,
};

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<MultipartSession> {
    fn id<T>(value: String) -> rusqlite::Result<T>
    where
        T: FromStr<Err = anyhow::Error>,
    {
        value.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })
    }

    Ok(MultipartSession {
        id: id(row.get::<_, String>(0)?)?,
        file_id: id(row.get::<_, String>(1)?)?,
        upload_id: row.get(2)?,
        owner_id: id(row.get::<_, String>(3)?)?,
        filename: row.get(4)?,
        content_type: row.get(5)?,
        parent_id: row.get::<_, Option<String>>(6)?.map(id).transpose()?,
        total_size: row.get::<_, i64>(7)? as u64,
        last_modified_at: row
            .get::<_, Option<i64>>(8)?
            .map(|ms| UnixTimestamp::from_millis(ms as u64)),
        expires_at: UnixTimestamp::from_millis(row.get::<_, i64>(9)? as u64),
    })
}

const SESSION_COLUMNS: &str = "id, file_id, upload_id, owner_id, filename, content_type, \
                               parent_id, total_size, last_modified_at, expires_at";

impl Database {
    pub fn insert_session(&self, session: &MultipartSession) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO multipart_sessions (id, file_id, upload_id, owner_id, filename, \
                 content_type, parent_id, total_size, last_modified_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session.id.to_string(),
                    session.file_id.to_string(),
                    session.upload_id,
                    session.owner_id.to_string(),
                    session.filename,
                    session.content_type,
                    session.parent_id.map(|id| id.to_string()),
                    session.total_size as i64,
                    session.last_modified_at.map(|t| t.as_millis() as i64),
                    session.expires_at.as_millis() as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, session_id: SessionId) -> anyhow::Result<Option<MultipartSession>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM multipart_sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![session_id.to_string()], session_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Returns whether a row was actually removed, so double-deletes on
    /// complete/abort races are observable.
    pub fn delete_session(&self, session_id: SessionId) -> anyhow::Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM multipart_sessions WHERE id = ?1",
                params![session_id.to_string()],
            )?;
            Ok(deleted > 0)
        })
    }

    pub fn expired_sessions(&self, now: UnixTimestamp) -> anyhow::Result<Vec<MultipartSession>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM multipart_sessions WHERE expires_at < ?1"
            ))?;
            let sessions = stmt
                .query_map(params![now.as_millis() as i64], session_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
    }
}
