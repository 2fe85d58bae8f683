//! Command queue repository functions.
//!
//! Trigger collaborators enqueue rows; the dispatcher takes the oldest
//! pending row, which flips it to `PROCESSING` under the table lock so no
//! two consumers ever see the same command.

use chrono::Utc;
use uuid::Uuid;

use crate::{
    DbError, DbPool,
    models::{CommandRow, CommandStatus, CommandType},
};

const ENTITY: &str = "command";

/// Enqueue a new command.
///
/// `payload` is the serialised command the dispatcher will decode.
pub fn enqueue_command(
    pool: &DbPool,
    id: Uuid,
    command_type: CommandType,
    payload: serde_json::Value,
) -> Result<CommandRow, DbError> {
    let now = Utc::now();
    let row = CommandRow {
        id,
        command_type,
        payload,
        status: CommandStatus::Pending,
        error: None,
        created_at: now,
        updated_at: now,
    };
    pool.commands.lock().push(row.clone());
    Ok(row)
}

/// Atomically fetch the oldest pending command and mark it `PROCESSING`.
///
/// Returns `None` if no pending commands exist.
pub fn fetch_next_command(pool: &DbPool) -> Option<CommandRow> {
    let mut table = pool.commands.lock();
    let row = table
        .iter_mut()
        .filter(|row| row.status == CommandStatus::Pending)
        .min_by_key(|row| row.created_at)?;

    row.status = CommandStatus::Processing;
    row.updated_at = Utc::now();
    Some(row.clone())
}

/// Mark a command as processed.
pub fn complete_command(pool: &DbPool, id: Uuid) -> Result<(), DbError> {
    finish(pool, id, CommandStatus::Processed, None)
}

/// Mark a command as failed, keeping the reason for operators.
pub fn fail_command(pool: &DbPool, id: Uuid, reason: &str) -> Result<(), DbError> {
    finish(pool, id, CommandStatus::Failed, Some(reason.to_owned()))
}

pub fn get_command(pool: &DbPool, id: Uuid) -> Result<CommandRow, DbError> {
    pool.commands
        .lock()
        .iter()
        .find(|row| row.id == id)
        .cloned()
        .ok_or_else(|| DbError::not_found(ENTITY, id))
}

fn finish(pool: &DbPool, id: Uuid, status: CommandStatus, error: Option<String>) -> Result<(), DbError> {
    let mut table = pool.commands.lock();
    let row = table
        .iter_mut()
        .find(|row| row.id == id)
        .ok_or_else(|| DbError::not_found(ENTITY, id))?;
    row.status = status;
    row.error = error;
    row.updated_at = Utc::now();
    Ok(())
}
