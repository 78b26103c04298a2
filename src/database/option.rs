use diesel::prelude::*;

use super::{get_connection, DbResult};
use crate::db_execute;
use crate::schema::options;

/// All rows of the options table as (key, value) pairs. The table is written
/// by the administrative surface; the relay only reads it on reload.
pub fn load_all_options() -> DbResult<Vec<(String, String)>> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        let rows = options::table
            .select((options::option_key, options::option_value))
            .load::<(String, String)>(conn)?;
        Ok(rows)
    })
}
