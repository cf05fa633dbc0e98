//! Command surface for the Elo ladder.
//!
//! Hosts can embed the ladder through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_ladder_with_db`] for a single [`LadderCommand`] against a DB path.
//! - [`run_ladder`] for execution against an already opened [`LadderSession`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use elo_ladder_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, HeadToHead, HeadToHeadRecord, LadderConfig,
    LadderSession, MatchRecord, MatchSide, MaterializedView, Player, StartingTier, DRAW,
};
use elo_ladder_store_sqlite::SqliteEventLogStore;
use serde::Serialize;

pub type SqliteLadderSession = LadderSession<SqliteEventLogStore>;

#[derive(Debug, Parser)]
#[command(name = "ladder")]
#[command(about = "Elo rating ladder backed by an event log")]
pub struct Cli {
    #[arg(long, default_value = "./ladder.sqlite3")]
    db: PathBuf,

    /// JSON file with ladder configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tracing filter, e.g. `info` or `elo_ladder_core=debug`.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[arg(long)]
    default_tier: Option<TierArg>,

    #[arg(long)]
    ranking_min_matches: Option<u32>,

    #[command(subcommand)]
    command: LadderCommand,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum LadderCommand {
    Player {
        #[command(subcommand)]
        command: PlayerCommand,
    },
    Match {
        #[command(subcommand)]
        command: MatchCommand,
    },
    /// Head-to-head records.
    H2h(H2hArgs),
    /// Full materialized view as JSON.
    View,
    Export(ExportArgs),
    /// Replace the log with the contents of a file.
    Import(ImportArgs),
    /// Delete every event.
    Reset(ResetArgs),
}

#[derive(Debug, Subcommand)]
pub enum PlayerCommand {
    Add(PlayerAddArgs),
    List(PlayerListArgs),
}

#[derive(Debug, Args)]
pub struct PlayerAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    tier: Option<TierArg>,
}

#[derive(Debug, Args)]
pub struct PlayerListArgs {
    /// List every player by matches played instead of the rating ranking.
    #[arg(long)]
    all: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum MatchCommand {
    Log(MatchLogArgs),
    List(MatchListArgs),
}

#[derive(Debug, Args)]
pub struct MatchLogArgs {
    #[arg(long)]
    player1: String,
    #[arg(long)]
    player2: String,
    /// Either player's name, or `draw`.
    #[arg(long)]
    winner: String,
    /// RFC3339 UTC timestamp; defaults to now.
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct MatchListArgs {
    #[arg(long)]
    player: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct H2hArgs {
    #[arg(long)]
    player: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    output: Option<PathBuf>,
    /// Write the match-only legacy list instead of the event log.
    #[arg(long)]
    legacy: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Beginner,
    Intermediate,
    Advanced,
}

impl From<TierArg> for StartingTier {
    fn from(value: TierArg) -> Self {
        match value {
            TierArg::Beginner => Self::Beginner,
            TierArg::Intermediate => Self::Intermediate,
            TierArg::Advanced => Self::Advanced,
        }
    }
}

#[derive(Debug, Serialize)]
struct PlayerRow<'a> {
    rank: Option<usize>,
    #[serde(flatten)]
    player: &'a Player,
}

#[derive(Debug, Serialize)]
struct ImportReport {
    imported_events: usize,
    players: usize,
    matches: usize,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = resolve_config(
        cli.config.as_deref(),
        cli.default_tier,
        cli.ranking_min_matches,
    )?;
    run_ladder_with_db(&cli.db, config, cli.command)
}

/// Executes one command against the `SQLite` DB at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_ladder_with_db(db_path: &Path, config: LadderConfig, command: LadderCommand) -> Result<()> {
    let store = SqliteEventLogStore::open(db_path)?;
    store.migrate()?;
    let mut session = LadderSession::open(store, config)?;
    run_ladder(command, &mut session)
}

/// Executes one command against an open session.
///
/// # Errors
/// Returns an error when validation, persistence, or output fails.
pub fn run_ladder(command: LadderCommand, session: &mut SqliteLadderSession) -> Result<()> {
    match command {
        LadderCommand::Player { command } => run_player(command, session),
        LadderCommand::Match { command } => run_match(command, session),
        LadderCommand::H2h(args) => {
            let view = session.view();
            match args.player {
                Some(player) => {
                    if view.player(&player).is_none() {
                        bail!("unknown player: {player}");
                    }
                    let records = view.head_to_head_for(&player);
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    } else {
                        print_player_head_to_head(&records);
                    }
                }
                None => {
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&view.head_to_head)?);
                    } else {
                        print_head_to_head_table(&view.head_to_head);
                    }
                }
            }
            Ok(())
        }
        LadderCommand::View => {
            println!("{}", serde_json::to_string_pretty(&session.view())?);
            Ok(())
        }
        LadderCommand::Export(args) => {
            let bytes = if args.legacy {
                session.export_legacy()?
            } else {
                session.export()?
            };
            match args.output {
                Some(path) => fs::write(&path, &bytes)
                    .with_context(|| format!("failed to write export to {}", path.display()))?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&bytes)?;
                    stdout.write_all(b"\n")?;
                }
            }
            Ok(())
        }
        LadderCommand::Import(args) => {
            let bytes = fs::read(&args.input)
                .with_context(|| format!("failed to read import file {}", args.input.display()))?;
            let imported_events = session.import(&bytes)?;
            let view = session.view();
            let report = ImportReport {
                imported_events,
                players: view.players.len(),
                matches: view.matches.len(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        LadderCommand::Reset(args) => {
            if !args.yes {
                bail!("refusing to reset the ladder without --yes");
            }
            session.reset()?;
            println!("ladder reset");
            Ok(())
        }
    }
}

fn run_player(command: PlayerCommand, session: &mut SqliteLadderSession) -> Result<()> {
    match command {
        PlayerCommand::Add(args) => {
            let added = session.add_player(&args.name, args.tier.map(Into::into), Some(now_utc()))?;
            println!("{}", serde_json::to_string_pretty(&added)?);
            Ok(())
        }
        PlayerCommand::List(args) => {
            let view = session.view();
            let players = if args.all {
                view.all_players_by_matches()
            } else {
                view.ranked_players()
            };
            let rows = player_rows(&view, &players);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_player_table(&rows);
            }
            Ok(())
        }
    }
}

fn run_match(command: MatchCommand, session: &mut SqliteLadderSession) -> Result<()> {
    match command {
        MatchCommand::Log(args) => {
            let at = parse_optional_utc(args.at.as_deref())?;
            let logged = session.log_match(&args.player1, &args.player2, &args.winner, Some(at))?;
            println!("{}", serde_json::to_string_pretty(&logged)?);
            Ok(())
        }
        MatchCommand::List(args) => {
            let view = session.view();
            let mut records: Vec<&MatchRecord> = match args.player.as_deref() {
                Some(player) => view.matches_for(player),
                None => view.matches.iter().collect(),
            };
            records.reverse();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_match_table(&records)?;
            }
            Ok(())
        }
    }
}

fn resolve_config(
    path: Option<&Path>,
    default_tier: Option<TierArg>,
    ranking_min_matches: Option<u32>,
) -> Result<LadderConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("config file {} must be valid JSON", path.display()))?;
            LadderConfig::from_json(&value)?
        }
        None => LadderConfig::default(),
    };

    if let Some(tier) = default_tier {
        config.default_starting_rating = StartingTier::from(tier).starting_rating();
    }
    if let Some(min_matches) = ranking_min_matches {
        config.ranking_min_matches = min_matches;
    }

    config.validate()?;
    tracing::debug!(?config, "resolved ladder configuration");
    Ok(config)
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn player_rows<'a>(view: &MaterializedView, players: &[&'a Player]) -> Vec<PlayerRow<'a>> {
    players
        .iter()
        .map(|&player| PlayerRow {
            rank: view.rank_of(&player.name),
            player,
        })
        .collect()
}

fn print_player_table(rows: &[PlayerRow<'_>]) {
    println!(
        "{:<5} {:<24} {:>7} {:>7} {:>6}",
        "rank", "name", "rating", "matches", "streak"
    );
    println!("{}", "-".repeat(53));

    for row in rows {
        let rank = row.rank.map(|rank| rank.to_string()).unwrap_or_default();
        let streak = if row.player.winstreak >= 2 {
            row.player.winstreak.to_string()
        } else {
            String::new()
        };
        println!(
            "{:<5} {:<24} {:>7} {:>7} {:>6}",
            rank, row.player.name, row.player.rating, row.player.matches_played, streak
        );
    }
}

fn print_match_table(records: &[&MatchRecord]) -> Result<()> {
    println!(
        "{:<20} {:<28} {:<28} {:<16} h2h",
        "timestamp", "player1", "player2", "winner"
    );
    println!("{}", "-".repeat(104));

    for record in records {
        let timestamp = match record.timestamp {
            Some(at) => format_rfc3339(at).map_err(|err| anyhow!(err.to_string()))?,
            None => String::new(),
        };
        println!(
            "{:<20} {:<28} {:<28} {:<16} {}-{}-{}",
            timestamp,
            describe_side(&record.player1),
            describe_side(&record.player2),
            if record.is_draw() { DRAW } else { record.winner.as_str() },
            record.h2h_after.player1_wins,
            record.h2h_after.draws,
            record.h2h_after.player2_wins
        );
    }

    Ok(())
}

fn describe_side(side: &MatchSide) -> String {
    format!(
        "{} {}->{} ({:+})",
        side.name, side.old_rating, side.new_rating, side.change
    )
}

fn print_head_to_head_table(records: &[HeadToHeadRecord]) {
    println!(
        "{:<24} {:<24} {:>6} {:>6} {:>6}",
        "first", "second", "wins", "losses", "draws"
    );
    println!("{}", "-".repeat(70));

    for record in records {
        println!(
            "{:<24} {:<24} {:>6} {:>6} {:>6}",
            record.first, record.second, record.first_wins, record.second_wins, record.draws
        );
    }
}

fn print_player_head_to_head(records: &[HeadToHead]) {
    println!(
        "{:<24} {:>6} {:>6} {:>6} {:>6}",
        "opponent", "wins", "losses", "draws", "total"
    );
    println!("{}", "-".repeat(52));

    for record in records {
        println!(
            "{:<24} {:>6} {:>6} {:>6} {:>6}",
            record.opponent,
            record.player_wins,
            record.opponent_wins,
            record.draws,
            record.total()
        );
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use elo_ladder_core::LadderError;
    use serde_json::json;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_path(label: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ladder-{label}-{}.{extension}", Ulid::new()))
    }

    fn execute_cli(db_path: &Path, args: &[&str]) -> Result<()> {
        let mut argv = vec![
            "ladder".to_string(),
            "--db".to_string(),
            db_path.display().to_string(),
        ];
        argv.extend(args.iter().map(ToString::to_string));
        let cli = Cli::try_parse_from(argv)?;
        run_cli(cli)
    }

    fn open_session(db_path: &Path) -> SqliteLadderSession {
        let store = must(SqliteEventLogStore::open(db_path));
        must(store.migrate());
        must(LadderSession::open(store, LadderConfig::default()))
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00+02:00")).is_err());
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00Z")).is_ok());
    }

    #[test]
    fn cli_overrides_take_precedence_over_config_file() {
        let config_path = temp_path("config", "json");
        must(
            fs::write(
                &config_path,
                json!({"default_starting_rating": 600, "ranking_min_matches": 7}).to_string(),
            )
            .map_err(Into::into),
        );

        let from_file = must(resolve_config(Some(&config_path), None, None));
        assert_eq!(from_file.default_starting_rating, 600.0);
        assert_eq!(from_file.ranking_min_matches, 7);

        let overridden = must(resolve_config(
            Some(&config_path),
            Some(TierArg::Advanced),
            Some(2),
        ));
        assert_eq!(overridden.default_starting_rating, 1000.0);
        assert_eq!(overridden.ranking_min_matches, 2);

        must(fs::write(&config_path, r#"{"default_starting_rating": 700}"#).map_err(Into::into));
        let invalid = resolve_config(Some(&config_path), None, None);
        assert!(invalid.is_err());

        let _ = fs::remove_file(&config_path);
    }

    #[test]
    fn end_to_end_commands_persist_events() {
        let db_path = temp_path("e2e", "sqlite3");

        must(execute_cli(&db_path, &["player", "add", "--name", "Alice", "--tier", "advanced"]));
        must(execute_cli(&db_path, &["player", "add", "--name", "Bob"]));
        must(execute_cli(
            &db_path,
            &["match", "log", "--player1", "Alice", "--player2", "Bob", "--winner", "Bob"],
        ));
        must(execute_cli(
            &db_path,
            &["match", "log", "--player1", "Bob", "--player2", "Alice", "--winner", DRAW],
        ));
        must(execute_cli(&db_path, &["player", "list", "--all"]));
        must(execute_cli(&db_path, &["match", "list", "--player", "Alice"]));
        must(execute_cli(&db_path, &["h2h", "--player", "Bob"]));
        must(execute_cli(&db_path, &["view"]));

        let session = open_session(&db_path);
        let view = session.view();
        assert_eq!(session.log().len(), 4);
        assert_eq!(view.players.len(), 2);
        assert_eq!(view.matches.len(), 2);
        assert_eq!(view.rankings.other_by_matches.len(), 2);
        let record = match view.head_to_head("Bob", "Alice") {
            Some(record) => record,
            None => panic!("expected a head-to-head record"),
        };
        assert_eq!(record.player_wins, 1);
        assert_eq!(record.draws, 1);

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn rejected_writes_leave_log_unchanged() {
        let db_path = temp_path("reject", "sqlite3");

        must(execute_cli(&db_path, &["player", "add", "--name", "Alice"]));
        assert!(execute_cli(&db_path, &["player", "add", "--name", "ALICE"]).is_err());
        assert!(execute_cli(&db_path, &["player", "add", "--name", "  "]).is_err());
        assert!(execute_cli(
            &db_path,
            &["match", "log", "--player1", "Alice", "--player2", "Zed", "--winner", "Alice"],
        )
        .is_err());
        assert!(execute_cli(&db_path, &["h2h", "--player", "Zed"]).is_err());
        assert!(execute_cli(&db_path, &["reset"]).is_err());

        let err = match open_session(&db_path).add_player("alice", None, None) {
            Ok(_) => panic!("expected duplicate name to be rejected"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<LadderError>().map(|err| matches!(err, LadderError::Validation(_))),
            Some(true)
        );
        assert_eq!(open_session(&db_path).log().len(), 1);

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn export_import_and_reset_round_trip() {
        let db_path = temp_path("roundtrip", "sqlite3");
        let export_path = temp_path("export", "json");
        let legacy_path = temp_path("legacy", "json");

        must(execute_cli(&db_path, &["player", "add", "--name", "A"]));
        must(execute_cli(&db_path, &["player", "add", "--name", "B"]));
        must(execute_cli(
            &db_path,
            &["match", "log", "--player1", "A", "--player2", "B", "--winner", "A", "--at", "2026-02-07T12:00:00Z"],
        ));
        let before = open_session(&db_path).view();

        let export_arg = export_path.display().to_string();
        let legacy_arg = legacy_path.display().to_string();
        must(execute_cli(&db_path, &["export", "--output", &export_arg]));
        must(execute_cli(&db_path, &["export", "--output", &legacy_arg, "--legacy"]));

        must(execute_cli(&db_path, &["reset", "--yes"]));
        assert!(open_session(&db_path).log().is_empty());

        must(execute_cli(&db_path, &["import", "--input", &export_arg]));
        assert_eq!(open_session(&db_path).view(), before);

        must(execute_cli(&db_path, &["import", "--input", &legacy_arg]));
        let from_legacy = open_session(&db_path).view();
        assert_eq!(from_legacy.matches, before.matches);

        must(fs::write(&export_path, "{\"not\": \"an array\"}").map_err(Into::into));
        assert!(execute_cli(&db_path, &["import", "--input", &export_arg]).is_err());
        assert_eq!(open_session(&db_path).view(), from_legacy);

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&export_path);
        let _ = fs::remove_file(&legacy_path);
    }
}
