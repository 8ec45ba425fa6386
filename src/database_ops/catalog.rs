//! Canonical entity reads/writes: sports, leagues, teams, bookmakers, events,
//! lines, results. All upserts are idempotent so ingestion can be re-run for
//! the same league or event and converge to identical stored state.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};

use crate::database_ops::db::Db;
use crate::ingest::LineFields;
use crate::normalization::team::normalize;
use crate::provider::{OddsEvent, SportInfo};
use crate::scheduler::SeasonWindow;

/// Write seam for the per-event ingestion cascade. Production code goes
/// through a live `PgConnection` inside a transaction; tests drive the same
/// cascade against an in-memory double so the keying rules (normalized team
/// name, event external id, (event, bookmaker) line identity) can be
/// exercised without a database.
#[async_trait]
pub trait CatalogWriter: Send {
    async fn ensure_team(&mut self, league_id: i64, raw_name: &str) -> Result<(i64, bool)>;
    async fn ensure_bookmaker(&mut self, key: &str, title: &str) -> Result<(i64, bool)>;
    async fn upsert_event(
        &mut self,
        league_id: i64,
        home_team_id: i64,
        away_team_id: i64,
        ev: &OddsEvent,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<(i64, bool)>;
    async fn upsert_line(
        &mut self,
        event_id: i64,
        bookmaker_id: i64,
        fields: &LineFields,
        last_update: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}

#[async_trait]
impl CatalogWriter for PgConnection {
    async fn ensure_team(&mut self, league_id: i64, raw_name: &str) -> Result<(i64, bool)> {
        ensure_team(self, league_id, raw_name).await
    }

    async fn ensure_bookmaker(&mut self, key: &str, title: &str) -> Result<(i64, bool)> {
        ensure_bookmaker(self, key, title).await
    }

    async fn upsert_event(
        &mut self,
        league_id: i64,
        home_team_id: i64,
        away_team_id: i64,
        ev: &OddsEvent,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<(i64, bool)> {
        upsert_event(self, league_id, home_team_id, away_team_id, ev, status, now).await
    }

    async fn upsert_line(
        &mut self,
        event_id: i64,
        bookmaker_id: i64,
        fields: &LineFields,
        last_update: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        upsert_line(self, event_id, bookmaker_id, fields, last_update).await
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeagueRow {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub season_start_month: Option<i32>,
    pub season_end_month: Option<i32>,
    pub last_odds_sync_at: Option<DateTime<Utc>>,
    pub last_results_sync_at: Option<DateTime<Utc>>,
}

pub async fn ensure_sport(db: &Db, name: &str, description: &str) -> Result<i64> {
    if let Some(r) = sqlx::query("SELECT id FROM sports WHERE name = $1")
        .persistent(false)
        .bind(name)
        .fetch_optional(&db.pool)
        .await?
    {
        return Ok(r.get::<i64, _>("id"));
    }
    let r = sqlx::query(
        "INSERT INTO sports (name, description, active, created_at, updated_at)
         VALUES ($1, $2, true, now(), now())
         ON CONFLICT (name) DO UPDATE SET updated_at = now()
         RETURNING id",
    )
    .persistent(false)
    .bind(name)
    .bind(description)
    .fetch_one(&db.pool)
    .await?;
    Ok(r.get::<i64, _>("id"))
}

/// Upsert a league from the provider's sports listing. Season months come from
/// configuration (business policy), not from the provider; existing values are
/// kept when no window is configured. Returns (id, created).
pub async fn upsert_league(
    db: &Db,
    sport_id: i64,
    info: &SportInfo,
    season: Option<SeasonWindow>,
) -> Result<(i64, bool)> {
    let (start_month, end_month) = match season {
        Some(w) => (Some(w.start_month as i32), Some(w.end_month as i32)),
        None => (None, None),
    };
    if let Some(r) = sqlx::query("SELECT id FROM leagues WHERE key = $1")
        .persistent(false)
        .bind(&info.key)
        .fetch_optional(&db.pool)
        .await?
    {
        let id = r.get::<i64, _>("id");
        sqlx::query(
            "UPDATE leagues
             SET sport_id = $2, name = $3, active = $4, has_outrights = $5,
                 season_start_month = COALESCE($6, season_start_month),
                 season_end_month = COALESCE($7, season_end_month),
                 updated_at = now()
             WHERE id = $1",
        )
        .persistent(false)
        .bind(id)
        .bind(sport_id)
        .bind(&info.title)
        .bind(info.active)
        .bind(info.has_outrights)
        .bind(start_month)
        .bind(end_month)
        .execute(&db.pool)
        .await?;
        return Ok((id, false));
    }
    let r = sqlx::query(
        "INSERT INTO leagues
             (sport_id, key, name, region, active, has_outrights,
              season_start_month, season_end_month, created_at, updated_at)
         VALUES ($1, $2, $3, 'us', $4, $5, $6, $7, now(), now())
         RETURNING id",
    )
    .persistent(false)
    .bind(sport_id)
    .bind(&info.key)
    .bind(&info.title)
    .bind(info.active)
    .bind(info.has_outrights)
    .bind(start_month)
    .bind(end_month)
    .fetch_one(&db.pool)
    .await?;
    Ok((r.get::<i64, _>("id"), true))
}

/// Find-or-create a team by its normalized name within the league. The
/// normalized name is the only cross-payload de-duplication key, so lookups
/// never go through the raw display name. Returns (id, created).
pub async fn ensure_team(
    conn: &mut PgConnection,
    league_id: i64,
    raw_name: &str,
) -> Result<(i64, bool)> {
    let normalized = normalize(raw_name);
    if let Some(r) =
        sqlx::query("SELECT id FROM teams WHERE league_id = $1 AND normalized_name = $2")
            .persistent(false)
            .bind(league_id)
            .bind(&normalized)
            .fetch_optional(&mut *conn)
            .await?
    {
        return Ok((r.get::<i64, _>("id"), false));
    }
    let r = sqlx::query(
        "INSERT INTO teams (league_id, name, normalized_name, active, created_at, updated_at)
         VALUES ($1, $2, $3, true, now(), now())
         RETURNING id",
    )
    .persistent(false)
    .bind(league_id)
    .bind(raw_name)
    .bind(&normalized)
    .fetch_one(&mut *conn)
    .await?;
    Ok((r.get::<i64, _>("id"), true))
}

pub async fn ensure_bookmaker(
    conn: &mut PgConnection,
    key: &str,
    title: &str,
) -> Result<(i64, bool)> {
    if let Some(r) = sqlx::query("SELECT id FROM bookmakers WHERE key = $1")
        .persistent(false)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok((r.get::<i64, _>("id"), false));
    }
    let r = sqlx::query(
        "INSERT INTO bookmakers (key, name, region, active, created_at, updated_at)
         VALUES ($1, $2, 'us', true, now(), now())
         RETURNING id",
    )
    .persistent(false)
    .bind(key)
    .bind(title)
    .fetch_one(&mut *conn)
    .await?;
    Ok((r.get::<i64, _>("id"), true))
}

/// Upsert an event by its upstream external id (the sole idempotency key).
/// Mutable fields are refreshed; `completed` is left untouched here because
/// only a results sync may set it. Returns (id, created).
pub async fn upsert_event(
    conn: &mut PgConnection,
    league_id: i64,
    home_team_id: i64,
    away_team_id: i64,
    ev: &OddsEvent,
    status: &str,
    now: DateTime<Utc>,
) -> Result<(i64, bool)> {
    if let Some(r) = sqlx::query("SELECT id FROM events WHERE odds_api_id = $1")
        .persistent(false)
        .bind(&ev.id)
        .fetch_optional(&mut *conn)
        .await?
    {
        let id = r.get::<i64, _>("id");
        sqlx::query(
            "UPDATE events
             SET league_id = $2, home_team_id = $3, away_team_id = $4,
                 home_team_name = $5, away_team_name = $6,
                 commence_time = $7, status = $8, last_sync_at = $9, updated_at = now()
             WHERE id = $1",
        )
        .persistent(false)
        .bind(id)
        .bind(league_id)
        .bind(home_team_id)
        .bind(away_team_id)
        .bind(&ev.home_team)
        .bind(&ev.away_team)
        .bind(ev.commence_time)
        .bind(status)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        return Ok((id, false));
    }
    let r = sqlx::query(
        "INSERT INTO events
             (league_id, odds_api_id, home_team_id, away_team_id,
              home_team_name, away_team_name, commence_time, status, completed,
              last_sync_at, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, $9, now(), now())
         RETURNING id",
    )
    .persistent(false)
    .bind(league_id)
    .bind(&ev.id)
    .bind(home_team_id)
    .bind(away_team_id)
    .bind(&ev.home_team)
    .bind(&ev.away_team)
    .bind(ev.commence_time)
    .bind(status)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok((r.get::<i64, _>("id"), true))
}

/// Upsert the single denormalized line per (event, bookmaker). Absent market
/// outcomes arrive as None and are stored as NULLs; an incomplete line is a
/// valid row, not an error. Returns true when a new row was created.
pub async fn upsert_line(
    conn: &mut PgConnection,
    event_id: i64,
    bookmaker_id: i64,
    fields: &LineFields,
    last_update: Option<DateTime<Utc>>,
) -> Result<bool> {
    let existing =
        sqlx::query("SELECT id FROM lines WHERE event_id = $1 AND bookmaker_id = $2")
            .persistent(false)
            .bind(event_id)
            .bind(bookmaker_id)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(r) = existing {
        let id = r.get::<i64, _>("id");
        sqlx::query(
            "UPDATE lines
             SET money_line_home = $2, money_line_away = $3, draw_line = $4,
                 point_spread_home = $5, point_spread_away = $6,
                 point_spread_home_line = $7, point_spread_away_line = $8,
                 total_number = $9, over_line = $10, under_line = $11,
                 last_updated = $12, updated_at = now()
             WHERE id = $1",
        )
        .persistent(false)
        .bind(id)
        .bind(fields.money_line_home)
        .bind(fields.money_line_away)
        .bind(fields.draw_line)
        .bind(fields.point_spread_home)
        .bind(fields.point_spread_away)
        .bind(fields.point_spread_home_line)
        .bind(fields.point_spread_away_line)
        .bind(fields.total_number)
        .bind(fields.over_line)
        .bind(fields.under_line)
        .bind(last_update)
        .execute(&mut *conn)
        .await?;
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO lines
             (event_id, bookmaker_id, money_line_home, money_line_away, draw_line,
              point_spread_home, point_spread_away,
              point_spread_home_line, point_spread_away_line,
              total_number, over_line, under_line,
              source, last_updated, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                 'the-odds-api', $13, now(), now())",
    )
    .persistent(false)
    .bind(event_id)
    .bind(bookmaker_id)
    .bind(fields.money_line_home)
    .bind(fields.money_line_away)
    .bind(fields.draw_line)
    .bind(fields.point_spread_home)
    .bind(fields.point_spread_away)
    .bind(fields.point_spread_home_line)
    .bind(fields.point_spread_away_line)
    .bind(fields.total_number)
    .bind(fields.over_line)
    .bind(fields.under_line)
    .bind(last_update)
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

/// Upsert the result for an event and mark the parent event completed. This is
/// the only path that sets `completed`.
pub async fn upsert_result(
    conn: &mut PgConnection,
    event_id: i64,
    home_score: Option<i32>,
    away_score: Option<i32>,
    is_final: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO results (event_id, home_score, away_score, final, created_at, updated_at)
         VALUES ($1, $2, $3, $4, now(), now())
         ON CONFLICT (event_id) DO UPDATE
         SET home_score = EXCLUDED.home_score,
             away_score = EXCLUDED.away_score,
             final = EXCLUDED.final,
             updated_at = now()",
    )
    .persistent(false)
    .bind(event_id)
    .bind(home_score)
    .bind(away_score)
    .bind(is_final)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE events SET completed = true, status = 'completed', updated_at = now()
         WHERE id = $1",
    )
    .persistent(false)
    .bind(event_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn find_league(db: &Db, key: &str) -> Result<Option<LeagueRow>> {
    let row = sqlx::query_as::<_, LeagueRow>(
        "SELECT id, key, name, season_start_month, season_end_month,
                last_odds_sync_at, last_results_sync_at
         FROM leagues WHERE key = $1",
    )
    .persistent(false)
    .bind(key)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row)
}

pub async fn active_leagues(db: &Db, keys: &[String]) -> Result<Vec<LeagueRow>> {
    let rows = sqlx::query_as::<_, LeagueRow>(
        "SELECT id, key, name, season_start_month, season_end_month,
                last_odds_sync_at, last_results_sync_at
         FROM leagues
         WHERE active = true AND key = ANY($1)
         ORDER BY key",
    )
    .persistent(false)
    .bind(keys)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// Seconds until the league's next scheduled event, None when none upcoming.
pub async fn seconds_until_next_event(
    db: &Db,
    league_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let next: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT MIN(commence_time) FROM events WHERE league_id = $1 AND commence_time > $2",
    )
    .persistent(false)
    .bind(league_id)
    .bind(now)
    .fetch_one(&db.pool)
    .await?;
    Ok(next.map(|t| (t - now).num_seconds()))
}

/// Whether the league has a live game or one that finished within the last
/// three hours; only then is a results refresh worth a provider request.
pub async fn has_active_events(db: &Db, league_id: i64, now: DateTime<Utc>) -> Result<bool> {
    let active: bool = sqlx::query_scalar(
        "SELECT EXISTS(
             SELECT 1 FROM events
             WHERE league_id = $1
               AND ((commence_time <= $2 AND completed = false)
                 OR (completed = true AND commence_time > $2 - interval '3 hours'))
         )",
    )
    .persistent(false)
    .bind(league_id)
    .bind(now)
    .fetch_one(&db.pool)
    .await?;
    Ok(active)
}

pub async fn mark_odds_synced(db: &Db, league_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE leagues SET last_odds_sync_at = $2 WHERE id = $1")
        .persistent(false)
        .bind(league_id)
        .bind(now)
        .execute(&db.pool)
        .await?;
    Ok(())
}

pub async fn mark_results_synced(db: &Db, league_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE leagues SET last_results_sync_at = $2 WHERE id = $1")
        .persistent(false)
        .bind(league_id)
        .bind(now)
        .execute(&db.pool)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRef {
    pub id: i64,
    pub home_team_name: String,
    pub away_team_name: String,
}

pub async fn find_event_by_external_id(db: &Db, odds_api_id: &str) -> Result<Option<EventRef>> {
    let row = sqlx::query_as::<_, EventRef>(
        "SELECT id, home_team_name, away_team_name FROM events WHERE odds_api_id = $1",
    )
    .persistent(false)
    .bind(odds_api_id)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row)
}
