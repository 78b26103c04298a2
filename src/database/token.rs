use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{get_connection, DbError, DbResult};
use crate::db_execute;
use crate::schema::tokens;

pub const TOKEN_STATUS_ENABLED: i32 = 1;
pub const TOKEN_STATUS_DISABLED: i32 = 2;
pub const TOKEN_STATUS_EXPIRED: i32 = 3;
pub const TOKEN_STATUS_EXHAUSTED: i32 = 4;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = tokens)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub token_key: String,
    pub name: String,
    pub status: i32,
    pub remaining_quota: i64,
    pub unlimited_quota: bool,
    pub expired_time: i64,
    pub created_time: i64,
    pub accessed_time: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token has been disabled")]
    Disabled,
    #[error("token has expired")]
    Expired,
    #[error("token quota is exhausted")]
    Exhausted,
    #[error("token quota is not enough")]
    QuotaNotEnough,
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<diesel::result::Error> for TokenError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => TokenError::Invalid,
            other => TokenError::Db(DbError::Query(other)),
        }
    }
}

/// Looks up a bearer key and checks status, expiry, and remaining quota.
/// Observed expiry/exhaustion is written back to the token's status.
pub fn validate_token(key: &str) -> Result<Token, TokenError> {
    let conn = &mut get_connection().map_err(TokenError::Db)?;
    let token: Token = db_execute!(conn, {
        tokens::table
            .filter(tokens::token_key.eq(key))
            .select(Token::as_select())
            .first::<Token>(conn)
    })?;

    match token.status {
        TOKEN_STATUS_ENABLED => {}
        TOKEN_STATUS_DISABLED => return Err(TokenError::Disabled),
        TOKEN_STATUS_EXPIRED => return Err(TokenError::Expired),
        TOKEN_STATUS_EXHAUSTED => return Err(TokenError::Exhausted),
        _ => return Err(TokenError::Invalid),
    }

    let now = Utc::now().timestamp();
    if token.expired_time != -1 && token.expired_time < now {
        update_token_status(token.id, TOKEN_STATUS_EXPIRED);
        return Err(TokenError::Expired);
    }
    if !token.unlimited_quota && token.remaining_quota <= 0 {
        update_token_status(token.id, TOKEN_STATUS_EXHAUSTED);
        return Err(TokenError::Exhausted);
    }

    touch_token(token.id, now);
    Ok(token)
}

fn update_token_status(token_id: i64, status: i32) {
    let result = (|| -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(tokens::table.find(token_id))
                .set(tokens::status.eq(status))
                .execute(conn)?;
            Ok(())
        })
    })();
    if let Err(e) = result {
        error!("failed to update token {} status: {}", token_id, e);
    }
}

fn touch_token(token_id: i64, now: i64) {
    let result = (|| -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(tokens::table.find(token_id))
                .set(tokens::accessed_time.eq(now))
                .execute(conn)?;
            Ok(())
        })
    })();
    if let Err(e) = result {
        error!("failed to touch token {}: {}", token_id, e);
    }
}

/// Tentatively deducts quota before dispatch. The guarded update serializes
/// concurrent preconsumers through the row: zero rows affected means some
/// other settler got there first and the balance no longer covers the amount.
pub fn pre_consume_token_quota(token_id: i64, quota: i64) -> Result<(), TokenError> {
    if quota <= 0 {
        return Ok(());
    }
    let conn = &mut get_connection().map_err(TokenError::Db)?;
    let token: Token = db_execute!(conn, {
        tokens::table
            .find(token_id)
            .select(Token::as_select())
            .first::<Token>(conn)
    })?;
    if token.unlimited_quota {
        return Ok(());
    }
    let updated = db_execute!(conn, {
        diesel::update(
            tokens::table
                .find(token_id)
                .filter(tokens::remaining_quota.ge(quota)),
        )
        .set(tokens::remaining_quota.eq(tokens::remaining_quota - quota))
        .execute(conn)
    })?;
    if updated == 0 {
        return Err(TokenError::QuotaNotEnough);
    }
    Ok(())
}

/// Applies the settlement delta to the token's remaining quota; a negative
/// delta refunds. Unlimited tokens are left untouched. Always a direct row
/// update: a later preconsume on the same token must observe this balance.
pub fn post_consume_token_quota(token_id: i64, delta: i64) -> DbResult<()> {
    if delta == 0 {
        return Ok(());
    }
    apply_token_quota_delta(token_id, delta)
}

fn apply_token_quota_delta(token_id: i64, delta: i64) -> DbResult<()> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        diesel::update(
            tokens::table
                .find(token_id)
                .filter(tokens::unlimited_quota.eq(false)),
        )
        .set(tokens::remaining_quota.eq(tokens::remaining_quota - delta))
        .execute(conn)?;
        Ok(())
    })
}
