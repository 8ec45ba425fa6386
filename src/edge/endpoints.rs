//! Registry of cacheable endpoints and their database queries.
//!
//! Each endpoint has a cheap freshness signal (max `updated_at` over exactly
//! the rows its response would include) and a materialization query that
//! builds the full JSON body. The syncer runs the signal first and only
//! materializes when something actually changed. `events` and `lines` also
//! exist league-scoped (`events/{league_key}`, `lines/{league_key}`) so the
//! edge can serve per-league reads without filtering client-side.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use crate::database_ops::db::Db;

/// How aggressively an endpoint is re-checked. Critical endpoints carry
/// moving odds and live results; static ones change a few times a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Critical,
    Static,
}

impl CacheTier {
    pub fn interval_secs(self) -> u64 {
        match self {
            CacheTier::Critical => 120,
            CacheTier::Static => 1800,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub tier: CacheTier,
}

/// Full endpoint set for the given leagues: fixed reference and odds
/// endpoints plus a per-league pair of events and lines views.
pub fn registry(league_keys: &[String]) -> Vec<Endpoint> {
    let fixed: &[(&str, CacheTier)] = &[
        ("sports", CacheTier::Static),
        ("leagues", CacheTier::Static),
        ("teams", CacheTier::Static),
        ("bookmakers", CacheTier::Static),
        ("events", CacheTier::Critical),
        ("lines", CacheTier::Critical),
        ("lines/incomplete", CacheTier::Critical),
        ("results", CacheTier::Critical),
    ];
    let mut endpoints: Vec<Endpoint> = fixed
        .iter()
        .map(|(name, tier)| Endpoint { name: (*name).to_string(), tier: *tier })
        .collect();
    for key in league_keys {
        endpoints.push(Endpoint { name: format!("events/{key}"), tier: CacheTier::Critical });
        endpoints.push(Endpoint { name: format!("lines/{key}"), tier: CacheTier::Critical });
    }
    endpoints
}

pub fn cache_key(endpoint: &str) -> String {
    format!("cache:{endpoint}")
}

pub fn cursor_key(endpoint: &str) -> String {
    format!("sync_time:{endpoint}")
}

/// Split an endpoint name into its base and optional league scope.
/// `lines/incomplete` is a fixed view, not a league scope.
fn split_scope(endpoint: &str) -> (&str, Option<&str>) {
    match endpoint.split_once('/') {
        Some(("lines", "incomplete")) => ("lines/incomplete", None),
        Some((base, league)) => (base, Some(league)),
        None => (endpoint, None),
    }
}

// All 9 fields a complete line carries (draw is optional, three-way markets
// only). num_nulls > 0 is exactly the is_complete predicate, negated.
const INCOMPLETE_PREDICATE: &str = "num_nulls(
    l.money_line_home, l.money_line_away,
    l.point_spread_home, l.point_spread_away,
    l.point_spread_home_line, l.point_spread_away_line,
    l.total_number, l.over_line, l.under_line) > 0";

/// Latest `updated_at` among the endpoint's source rows, None when the
/// backing set is empty.
pub async fn freshness_signal(db: &Db, endpoint: &str) -> Result<Option<DateTime<Utc>>> {
    let (base, league) = split_scope(endpoint);
    let sql = match base {
        "sports" => "SELECT MAX(updated_at) FROM sports WHERE active = true".to_string(),
        "leagues" => "SELECT MAX(updated_at) FROM leagues WHERE active = true".to_string(),
        "teams" => "SELECT MAX(updated_at) FROM teams WHERE active = true".to_string(),
        "bookmakers" => "SELECT MAX(updated_at) FROM bookmakers WHERE active = true".to_string(),
        "events" => {
            "SELECT MAX(e.updated_at) FROM events e
             JOIN leagues lg ON lg.id = e.league_id
             WHERE (e.completed = false OR e.updated_at > now() - interval '1 day')
               AND ($1::text IS NULL OR lg.key = $1)"
                .to_string()
        }
        "lines" => {
            "SELECT MAX(l.updated_at) FROM lines l
             JOIN events e ON e.id = l.event_id
             JOIN leagues lg ON lg.id = e.league_id
             WHERE e.completed = false
               AND ($1::text IS NULL OR lg.key = $1)"
                .to_string()
        }
        "lines/incomplete" => format!(
            "SELECT MAX(l.updated_at) FROM lines l
             JOIN events e ON e.id = l.event_id
             WHERE e.completed = false AND {INCOMPLETE_PREDICATE}"
        ),
        "results" => {
            "SELECT MAX(r.updated_at) FROM results r
             WHERE r.updated_at > now() - interval '7 days'"
                .to_string()
        }
        other => bail!("unknown cache endpoint: {other}"),
    };
    let mut query = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(&sql).persistent(false);
    if sql.contains("$1") {
        query = query.bind(league);
    }
    Ok(query.fetch_one(&db.pool).await?)
}

/// Materialize the endpoint's full JSON body. An empty backing set yields an
/// empty array, which is still a publishable payload.
pub async fn materialize(db: &Db, endpoint: &str) -> Result<Value> {
    let (base, league) = split_scope(endpoint);
    let events_body = "SELECT COALESCE(json_agg(json_build_object(
             'id', e.odds_api_id, 'league', lg.key,
             'home_team', e.home_team_name, 'away_team', e.away_team_name,
             'commence_time', e.commence_time, 'status', e.status,
             'completed', e.completed
         ) ORDER BY e.commence_time), '[]'::json) AS body
         FROM events e
         JOIN leagues lg ON lg.id = e.league_id
         WHERE (e.completed = false OR e.updated_at > now() - interval '1 day')
           AND ($1::text IS NULL OR lg.key = $1)";
    let lines_select = "SELECT COALESCE(json_agg(json_build_object(
             'event_id', e.odds_api_id, 'league', lg.key, 'bookmaker', b.key,
             'money_line_home', l.money_line_home,
             'money_line_away', l.money_line_away,
             'draw_line', l.draw_line,
             'point_spread_home', l.point_spread_home,
             'point_spread_away', l.point_spread_away,
             'point_spread_home_line', l.point_spread_home_line,
             'point_spread_away_line', l.point_spread_away_line,
             'total_number', l.total_number,
             'over_line', l.over_line, 'under_line', l.under_line,
             'last_updated', l.last_updated
         ) ORDER BY e.commence_time, b.key), '[]'::json) AS body
         FROM lines l
         JOIN events e ON e.id = l.event_id
         JOIN leagues lg ON lg.id = e.league_id
         JOIN bookmakers b ON b.id = l.bookmaker_id
         WHERE e.completed = false";

    let sql = match base {
        "sports" => {
            "SELECT COALESCE(json_agg(json_build_object(
                 'name', name, 'description', description
             ) ORDER BY name), '[]'::json) AS body
             FROM sports WHERE active = true"
                .to_string()
        }
        "leagues" => {
            "SELECT COALESCE(json_agg(json_build_object(
                 'key', key, 'name', name, 'sport_id', sport_id,
                 'season_start_month', season_start_month,
                 'season_end_month', season_end_month
             ) ORDER BY key), '[]'::json) AS body
             FROM leagues WHERE active = true"
                .to_string()
        }
        "teams" => {
            "SELECT COALESCE(json_agg(json_build_object(
                 'league', lg.key, 'name', t.name,
                 'normalized_name', t.normalized_name
             ) ORDER BY lg.key, t.normalized_name), '[]'::json) AS body
             FROM teams t
             JOIN leagues lg ON lg.id = t.league_id
             WHERE t.active = true"
                .to_string()
        }
        "bookmakers" => {
            "SELECT COALESCE(json_agg(json_build_object(
                 'key', key, 'name', name
             ) ORDER BY key), '[]'::json) AS body
             FROM bookmakers WHERE active = true"
                .to_string()
        }
        "events" => events_body.to_string(),
        "lines" => format!("{lines_select} AND ($1::text IS NULL OR lg.key = $1)"),
        "lines/incomplete" => format!("{lines_select} AND {INCOMPLETE_PREDICATE}"),
        "results" => {
            "SELECT COALESCE(json_agg(json_build_object(
                 'event_id', e.odds_api_id, 'league', lg.key,
                 'home_team', e.home_team_name, 'away_team', e.away_team_name,
                 'home_score', r.home_score, 'away_score', r.away_score,
                 'final', r.final, 'commence_time', e.commence_time
             ) ORDER BY e.commence_time DESC), '[]'::json) AS body
             FROM results r
             JOIN events e ON e.id = r.event_id
             JOIN leagues lg ON lg.id = e.league_id
             WHERE r.updated_at > now() - interval '7 days'"
                .to_string()
        }
        other => bail!("unknown cache endpoint: {other}"),
    };
    let mut query = sqlx::query(&sql).persistent(false);
    if sql.contains("$1") {
        query = query.bind(league);
    }
    let row = query.fetch_one(&db.pool).await?;
    Ok(row.get::<Value, _>("body"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_intervals() {
        assert_eq!(CacheTier::Critical.interval_secs(), 120);
        assert_eq!(CacheTier::Static.interval_secs(), 1800);
    }

    #[test]
    fn registry_partitions_by_tier() {
        let leagues = vec!["basketball_nba".to_string()];
        let endpoints = registry(&leagues);

        let critical: Vec<&str> = endpoints
            .iter()
            .filter(|e| e.tier == CacheTier::Critical)
            .map(|e| e.name.as_str())
            .collect();
        let statics: Vec<&str> = endpoints
            .iter()
            .filter(|e| e.tier == CacheTier::Static)
            .map(|e| e.name.as_str())
            .collect();

        assert_eq!(statics, vec!["sports", "leagues", "teams", "bookmakers"]);
        assert_eq!(
            critical,
            vec![
                "events",
                "lines",
                "lines/incomplete",
                "results",
                "events/basketball_nba",
                "lines/basketball_nba",
            ]
        );
    }

    #[test]
    fn key_formats() {
        assert_eq!(cache_key("lines"), "cache:lines");
        assert_eq!(cursor_key("lines"), "sync_time:lines");
        assert_eq!(cache_key("lines/basketball_nba"), "cache:lines/basketball_nba");
    }

    #[test]
    fn scope_splitting() {
        assert_eq!(split_scope("lines"), ("lines", None));
        assert_eq!(split_scope("lines/incomplete"), ("lines/incomplete", None));
        assert_eq!(split_scope("lines/basketball_nba"), ("lines", Some("basketball_nba")));
        assert_eq!(split_scope("events/baseball_mlb"), ("events", Some("baseball_mlb")));
    }
}
