use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::{get_connection, DbError, DbResult};
use crate::db_execute;
use crate::schema::users;

pub const USER_STATUS_ENABLED: i32 = 1;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub user_group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub status: i32,
}

pub fn get_user(user_id: i64) -> DbResult<User> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        let user = users::table
            .find(user_id)
            .select(User::as_select())
            .first::<User>(conn)?;
        Ok(user)
    })
}

pub fn get_user_quota(user_id: i64) -> DbResult<i64> {
    Ok(get_user(user_id)?.quota)
}

pub fn get_user_group(user_id: i64) -> DbResult<String> {
    let user = get_user(user_id)?;
    if user.status != USER_STATUS_ENABLED {
        return Err(DbError::Logic(format!("user {} is disabled", user_id)));
    }
    Ok(user.user_group)
}

/// Applies a settlement delta to the user's quota; a negative delta refunds.
pub fn decrease_user_quota(user_id: i64, delta: i64) -> DbResult<()> {
    if delta == 0 {
        return Ok(());
    }
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        diesel::update(users::table.find(user_id))
            .set(users::quota.eq(users::quota - delta))
            .execute(conn)?;
        Ok(())
    })
}

pub fn update_user_used_quota_and_request_count(user_id: i64, quota: i64) -> DbResult<()> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        let updated = diesel::update(users::table.find(user_id))
            .set((
                users::used_quota.eq(users::used_quota + quota),
                users::request_count.eq(users::request_count + 1),
            ))
            .execute(conn)?;
        if updated == 0 {
            return Err(DbError::Logic(format!("user {} not found", user_id)));
        }
        Ok(())
    })
}
