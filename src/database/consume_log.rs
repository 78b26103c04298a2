use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::{get_connection, DbResult};
use crate::db_execute;
use crate::schema::consume_logs;
use crate::utils::next_id;

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = consume_logs)]
pub struct ConsumeLog {
    pub id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: i64,
    pub model_name: String,
    pub token_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub content: String,
    pub created_at: i64,
}

#[allow(clippy::too_many_arguments)]
pub fn record_consume_log(
    user_id: i64,
    channel_id: i64,
    token_id: i64,
    model_name: &str,
    token_name: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
    quota: i64,
    content: &str,
) -> DbResult<()> {
    let log = ConsumeLog {
        id: next_id(),
        user_id,
        channel_id,
        token_id,
        model_name: model_name.to_string(),
        token_name: token_name.to_string(),
        prompt_tokens,
        completion_tokens,
        quota,
        content: content.to_string(),
        created_at: Utc::now().timestamp_millis(),
    };
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        diesel::insert_into(consume_logs::table)
            .values(&log)
            .execute(conn)?;
        Ok(())
    })
}
