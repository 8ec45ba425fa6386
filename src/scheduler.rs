//! Freshness scheduler.
//!
//! Every tick it walks the configured leagues and decides, per league, whether
//! an odds or results sync is due. The decision is driven by proximity of the
//! next event: game time approaching means odds move fast and the refresh
//! interval tightens. Cooldown timestamps live on the league rows and are only
//! advanced by a successful sync, so a failed run is retried on the next tick
//! rather than silently skipped for a full interval.

use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::database_ops::catalog::{self, LeagueRow};
use crate::database_ops::db::Db;
use crate::jobs::{JobQueue, SyncJob};
use crate::util::env::env_opt;

/// Odds refresh cadence by proximity of the next event.
pub const INTERVAL_IMMINENT_SECS: i64 = 120;
pub const INTERVAL_UPCOMING_SECS: i64 = 600;
pub const INTERVAL_IDLE_SECS: i64 = 1800;

/// Proximity thresholds, in seconds until the next event.
pub const IMMINENT_THRESHOLD_SECS: i64 = 600;
pub const UPCOMING_THRESHOLD_SECS: i64 = 7200;

/// Results refresh cadence while games are live or recently finished.
pub const RESULTS_INTERVAL_SECS: i64 = 120;

/// Inclusive month window a league is in season, possibly wrapping the year
/// boundary (NBA is October through April: start 10, end 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonWindow {
    pub start_month: u32,
    pub end_month: u32,
}

impl SeasonWindow {
    /// Whether `month` (1..=12) falls inside the window. A wrapped window
    /// covers both ends of the year; start == end means a single month.
    pub fn contains(&self, month: u32) -> bool {
        if self.start_month <= self.end_month {
            (self.start_month..=self.end_month).contains(&month)
        } else {
            month >= self.start_month || month <= self.end_month
        }
    }
}

/// Built-in season windows for the leagues this service was built around.
/// `LEAGUE_SEASONS` overrides or extends these.
const DEFAULT_SEASONS: &[(&str, SeasonWindow)] = &[
    ("americanfootball_nfl", SeasonWindow { start_month: 9, end_month: 2 }),
    ("basketball_nba", SeasonWindow { start_month: 10, end_month: 4 }),
    ("icehockey_nhl", SeasonWindow { start_month: 10, end_month: 4 }),
    ("baseball_mlb", SeasonWindow { start_month: 3, end_month: 10 }),
];

/// Season windows keyed by league key, from defaults plus the optional
/// `LEAGUE_SEASONS` env override (`basketball_nba=10-4,baseball_mlb=3-10`).
/// Malformed entries are skipped with a warning rather than failing startup.
pub fn season_windows() -> IndexMap<String, SeasonWindow> {
    let mut map: IndexMap<String, SeasonWindow> = DEFAULT_SEASONS
        .iter()
        .map(|(k, w)| (k.to_string(), *w))
        .collect();
    if let Some(raw) = env_opt("LEAGUE_SEASONS") {
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match parse_season_entry(entry) {
                Some((key, window)) => {
                    map.insert(key, window);
                }
                None => warn!(entry, "ignoring malformed LEAGUE_SEASONS entry"),
            }
        }
    }
    map
}

fn parse_season_entry(entry: &str) -> Option<(String, SeasonWindow)> {
    let (key, months) = entry.split_once('=')?;
    let (start, end) = months.split_once('-')?;
    let start_month: u32 = start.trim().parse().ok()?;
    let end_month: u32 = end.trim().parse().ok()?;
    if !(1..=12).contains(&start_month) || !(1..=12).contains(&end_month) {
        return None;
    }
    Some((key.trim().to_string(), SeasonWindow { start_month, end_month }))
}

/// Whether the league is in season right now. A league without a configured
/// window is treated as always in season.
pub fn in_season(window: Option<SeasonWindow>, now: DateTime<Utc>) -> bool {
    match window {
        Some(w) => w.contains(now.month()),
        None => true,
    }
}

/// Pick the odds refresh interval from seconds until the league's next event.
/// Boundary values take the faster tier. No upcoming event means no odds
/// refresh is due at all.
pub fn odds_interval(seconds_until_next: Option<i64>) -> Option<i64> {
    match seconds_until_next {
        Some(s) if s <= IMMINENT_THRESHOLD_SECS => Some(INTERVAL_IMMINENT_SECS),
        Some(s) if s <= UPCOMING_THRESHOLD_SECS => Some(INTERVAL_UPCOMING_SECS),
        Some(_) => Some(INTERVAL_IDLE_SECS),
        None => None,
    }
}

/// Whether enough time has passed since the last successful sync. A league
/// never synced is always due.
pub fn cooldown_elapsed(
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval_secs: i64,
) -> bool {
    match last_sync {
        Some(t) => (now - t).num_seconds() >= interval_secs,
        None => true,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub leagues_considered: usize,
    pub leagues_failed: usize,
    pub odds_jobs: usize,
    pub results_jobs: usize,
    pub skipped_off_season: usize,
    pub skipped_no_events: usize,
    pub skipped_cooldown: usize,
    pub skipped_in_flight: usize,
}

impl TickStats {
    fn absorb(&mut self, other: TickStats) {
        self.leagues_failed += other.leagues_failed;
        self.odds_jobs += other.odds_jobs;
        self.results_jobs += other.results_jobs;
        self.skipped_off_season += other.skipped_off_season;
        self.skipped_no_events += other.skipped_no_events;
        self.skipped_cooldown += other.skipped_cooldown;
        self.skipped_in_flight += other.skipped_in_flight;
    }
}

pub struct Scheduler {
    db: Db,
    queue: JobQueue,
    league_keys: Vec<String>,
    seasons: IndexMap<String, SeasonWindow>,
}

impl Scheduler {
    pub fn new(db: Db, queue: JobQueue, league_keys: Vec<String>) -> Self {
        Self {
            db,
            queue,
            league_keys,
            seasons: season_windows(),
        }
    }

    pub fn season_for(&self, league_key: &str) -> Option<SeasonWindow> {
        self.seasons.get(league_key).copied()
    }

    /// One scheduling pass over the configured leagues. Leagues are evaluated
    /// concurrently and independently; a failure in one is logged and counted
    /// without touching the rest. Decisions only; the actual provider calls
    /// run on the worker pool.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats> {
        let leagues = catalog::active_leagues(&self.db, &self.league_keys).await?;
        let mut stats = TickStats {
            leagues_considered: leagues.len(),
            ..TickStats::default()
        };

        let outcomes = join_all(leagues.iter().map(|l| self.evaluate(l, now))).await;
        for (league, outcome) in leagues.iter().zip(outcomes) {
            match outcome {
                Ok(delta) => stats.absorb(delta),
                Err(e) => {
                    warn!(league = %league.key, error = %e, "league evaluation failed");
                    stats.leagues_failed += 1;
                }
            }
        }

        info!(
            considered = stats.leagues_considered,
            failed = stats.leagues_failed,
            odds = stats.odds_jobs,
            results = stats.results_jobs,
            off_season = stats.skipped_off_season,
            no_events = stats.skipped_no_events,
            cooldown = stats.skipped_cooldown,
            in_flight = stats.skipped_in_flight,
            "scheduler tick"
        );
        Ok(stats)
    }

    async fn evaluate(&self, league: &LeagueRow, now: DateTime<Utc>) -> Result<TickStats> {
        let mut delta = TickStats::default();
        let window = league_window(league).or_else(|| self.season_for(&league.key));
        if !in_season(window, now) {
            debug!(league = %league.key, "off season, skipping");
            delta.skipped_off_season += 1;
            return Ok(delta);
        }

        let next = catalog::seconds_until_next_event(&self.db, league.id, now).await?;
        match odds_interval(next) {
            Some(interval) if cooldown_elapsed(league.last_odds_sync_at, now, interval) => {
                let job = SyncJob::Odds {
                    league_id: league.id,
                    league_key: league.key.clone(),
                };
                if self.queue.enqueue(job) {
                    delta.odds_jobs += 1;
                } else {
                    delta.skipped_in_flight += 1;
                }
            }
            Some(_) => delta.skipped_cooldown += 1,
            None => delta.skipped_no_events += 1,
        }

        if catalog::has_active_events(&self.db, league.id, now).await?
            && cooldown_elapsed(league.last_results_sync_at, now, RESULTS_INTERVAL_SECS)
        {
            let job = SyncJob::Scores {
                league_id: league.id,
                league_key: league.key.clone(),
            };
            if self.queue.enqueue(job) {
                delta.results_jobs += 1;
            } else {
                delta.skipped_in_flight += 1;
            }
        }
        Ok(delta)
    }
}

fn league_window(league: &LeagueRow) -> Option<SeasonWindow> {
    match (league.season_start_month, league.season_end_month) {
        (Some(s), Some(e)) if (1..=12).contains(&s) && (1..=12).contains(&e) => {
            Some(SeasonWindow { start_month: s as u32, end_month: e as u32 })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_month(month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, month, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn season_window_wraps_year_boundary() {
        // October through April covers both ends of the calendar year.
        let nba = SeasonWindow { start_month: 10, end_month: 4 };
        for m in [10, 11, 12, 1, 2, 3, 4] {
            assert!(nba.contains(m), "month {m} should be in season");
        }
        for m in [5, 6, 7, 8, 9] {
            assert!(!nba.contains(m), "month {m} should be off season");
        }
    }

    #[test]
    fn season_window_plain_range() {
        let mlb = SeasonWindow { start_month: 3, end_month: 10 };
        assert!(mlb.contains(3));
        assert!(mlb.contains(10));
        assert!(!mlb.contains(2));
        assert!(!mlb.contains(11));
    }

    #[test]
    fn no_window_means_always_in_season() {
        assert!(in_season(None, at_month(7)));
    }

    #[test]
    fn odds_interval_tiers() {
        assert_eq!(odds_interval(Some(0)), Some(INTERVAL_IMMINENT_SECS));
        assert_eq!(odds_interval(Some(599)), Some(INTERVAL_IMMINENT_SECS));
        assert_eq!(odds_interval(Some(601)), Some(INTERVAL_UPCOMING_SECS));
        assert_eq!(odds_interval(Some(7199)), Some(INTERVAL_UPCOMING_SECS));
        assert_eq!(odds_interval(Some(7201)), Some(INTERVAL_IDLE_SECS));
    }

    #[test]
    fn odds_interval_boundaries_take_faster_tier() {
        assert_eq!(odds_interval(Some(600)), Some(INTERVAL_IMMINENT_SECS));
        assert_eq!(odds_interval(Some(7200)), Some(INTERVAL_UPCOMING_SECS));
    }

    #[test]
    fn no_upcoming_event_means_no_odds_refresh() {
        assert_eq!(odds_interval(None), None);
    }

    #[test]
    fn cooldown_never_synced_is_due() {
        assert!(cooldown_elapsed(None, at_month(1), INTERVAL_IDLE_SECS));
    }

    #[test]
    fn cooldown_respects_interval() {
        let now = at_month(1);
        let recent = now - chrono::Duration::seconds(100);
        let stale = now - chrono::Duration::seconds(120);
        assert!(!cooldown_elapsed(Some(recent), now, 120));
        assert!(cooldown_elapsed(Some(stale), now, 120));
    }

    #[test]
    fn parses_season_override_entries() {
        let (key, w) = parse_season_entry("soccer_epl=8-5").unwrap();
        assert_eq!(key, "soccer_epl");
        assert_eq!(w, SeasonWindow { start_month: 8, end_month: 5 });

        assert!(parse_season_entry("nonsense").is_none());
        assert!(parse_season_entry("league=13-2").is_none());
        assert!(parse_season_entry("league=0-4").is_none());
    }
}
