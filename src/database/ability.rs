use diesel::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::channel::{Channel, CHANNEL_STATUS_ENABLED};
use super::{get_connection, DbError, DbResult};
use crate::db_execute;
use crate::schema::{abilities, channels};

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = abilities)]
pub struct Ability {
    pub ability_group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i64,
}

/// Picks a channel for (group, model): only the highest-priority enabled
/// abilities compete, with probability proportional to weight + 1 so
/// zero-weight channels stay reachable.
pub fn get_random_satisfied_channel(group: &str, model: &str) -> DbResult<Channel> {
    let candidates = get_enabled_abilities(group, model)?;
    let top = candidates
        .iter()
        .map(|a| a.priority)
        .max()
        .ok_or_else(|| DbError::Logic(format!("no channel available for {}/{}", group, model)))?;
    let pool: Vec<&Ability> = candidates.iter().filter(|a| a.priority == top).collect();

    let channel_id = pick_weighted(&pool, &mut rand::rng());
    super::channel::get_channel_by_id(channel_id)
}

fn get_enabled_abilities(group: &str, model: &str) -> DbResult<Vec<Ability>> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        let list = abilities::table
            .filter(abilities::ability_group.eq(group))
            .filter(abilities::model.eq(model))
            .filter(abilities::enabled.eq(true))
            .select(Ability::as_select())
            .load::<Ability>(conn)?;
        Ok(list)
    })
}

fn pick_weighted<R: Rng>(pool: &[&Ability], rng: &mut R) -> i64 {
    let total: i64 = pool.iter().map(|a| a.weight + 1).sum();
    let mut roll = rng.random_range(0..total);
    for ability in pool {
        roll -= ability.weight + 1;
        if roll < 0 {
            return ability.channel_id;
        }
    }
    pool[pool.len() - 1].channel_id
}

/// Rebuilds the derived (group, model) rows for one channel from its
/// comma-separated model and group lists.
pub fn rebuild_abilities_for_channel(channel: &Channel) -> DbResult<()> {
    let mut rows = Vec::new();
    for group in channel.channel_group.split(',') {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        for model in channel.models.split(',') {
            let model = model.trim();
            if model.is_empty() {
                continue;
            }
            rows.push(Ability {
                ability_group: group.to_string(),
                model: model.to_string(),
                channel_id: channel.id,
                enabled: channel.status == CHANNEL_STATUS_ENABLED,
                priority: channel.priority,
                weight: channel.weight,
            });
        }
    }

    let conn = &mut get_connection()?;
    db_execute!(conn, {
        diesel::delete(abilities::table.filter(abilities::channel_id.eq(channel.id)))
            .execute(conn)?;
        diesel::insert_into(abilities::table)
            .values(&rows)
            .execute(conn)?;
        Ok(())
    })
}

pub fn update_ability_status(channel_id: i64, enabled: bool) -> DbResult<()> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        diesel::update(abilities::table.filter(abilities::channel_id.eq(channel_id)))
            .set(abilities::enabled.eq(enabled))
            .execute(conn)?;
        Ok(())
    })
}

/// Full rebuild from the channels table, used by the warm load and the
/// realtime sync reload.
pub fn rebuild_all_abilities() -> DbResult<()> {
    let all: Vec<Channel> = {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let list = channels::table.select(Channel::as_select()).load::<Channel>(conn)?;
            Ok::<_, DbError>(list)
        })?
    };
    for channel in &all {
        rebuild_abilities_for_channel(channel)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ability(channel_id: i64, priority: i64, weight: i64) -> Ability {
        Ability {
            ability_group: "default".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            channel_id,
            enabled: true,
            priority,
            weight,
        }
    }

    #[test]
    fn test_pick_weighted_prefers_heavier_channels() {
        let a = ability(1, 0, 99);
        let b = ability(2, 0, 0);
        let pool = vec![&a, &b];
        let mut rng = StdRng::seed_from_u64(42);

        let mut hits = [0usize; 2];
        for _ in 0..1000 {
            match pick_weighted(&pool, &mut rng) {
                1 => hits[0] += 1,
                2 => hits[1] += 1,
                _ => unreachable!(),
            }
        }
        // 100:1 odds; the light channel must still be reachable.
        assert!(hits[0] > 900);
        assert!(hits[1] > 0);
    }

    #[test]
    fn test_pick_weighted_all_zero_weights_is_uniform_draw() {
        let a = ability(1, 0, 0);
        let b = ability(2, 0, 0);
        let pool = vec![&a, &b];
        let mut rng = StdRng::seed_from_u64(7);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(pick_weighted(&pool, &mut rng));
        }
        assert_eq!(seen.len(), 2);
    }
}
