use std::collections::{BTreeMap, HashMap, HashSet};
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

/// Winner value recorded for a drawn match.
pub const DRAW: &str = "draw";

pub const EVENT_TYPE_ADD_PLAYER: &str = "ADD_PLAYER";
pub const EVENT_TYPE_LOG_MATCH: &str = "LOG_MATCH";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LadderError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("format error: {0}")]
    Format(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StartingTier {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

impl StartingTier {
    pub const ALL: [Self; 3] = [Self::Beginner, Self::Intermediate, Self::Advanced];

    #[must_use]
    pub fn rating(self) -> i64 {
        match self {
            Self::Beginner => 600,
            Self::Intermediate => 800,
            Self::Advanced => 1000,
        }
    }

    #[must_use]
    pub fn starting_rating(self) -> f64 {
        match self {
            Self::Beginner => 600.0,
            Self::Intermediate => 800.0,
            Self::Advanced => 1000.0,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn from_rating(rating: f64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.starting_rating() == rating)
    }
}

/// Parameters of the dynamic K-factor curve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EloParameters {
    pub k_min: f64,
    pub k_max: f64,
    pub transition_matches: u32,
}

impl Default for EloParameters {
    fn default() -> Self {
        Self::standard()
    }
}

impl EloParameters {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            k_min: 20.0,
            k_max: 80.0,
            transition_matches: 20,
        }
    }

    /// Validates K-factor bounds.
    ///
    /// # Errors
    /// Returns [`LadderError::Configuration`] when a bound is not finite and
    /// positive, when `k_min` exceeds `k_max`, or when the transition length
    /// is zero.
    pub fn validate(&self) -> Result<(), LadderError> {
        for (name, value) in [("k_min", self.k_min), ("k_max", self.k_max)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(LadderError::Configuration(format!(
                    "{name} MUST be a finite positive number"
                )));
            }
        }

        if self.k_min > self.k_max {
            return Err(LadderError::Configuration(
                "k_min cannot exceed k_max".to_string(),
            ));
        }

        if self.transition_matches == 0 {
            return Err(LadderError::Configuration(
                "transition_matches MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// K-factor for a player who has already played `matches_played` matches.
    ///
    /// Decays from `k_max` at zero matches to `k_min` at `transition_matches`
    /// along a half cosine, so there is no step at the boundary.
    #[must_use]
    pub fn k_factor(&self, matches_played: u32) -> f64 {
        if matches_played >= self.transition_matches {
            return self.k_min;
        }

        let angle = f64::from(matches_played) / f64::from(self.transition_matches) * PI;
        let scaling = (1.0 + angle.cos()) / 2.0;
        self.k_min + (self.k_max - self.k_min) * scaling
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LadderConfig {
    pub default_starting_rating: f64,
    pub ranking_min_matches: u32,
    pub elo: EloParameters,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            default_starting_rating: 800.0,
            ranking_min_matches: 4,
            elo: EloParameters::standard(),
        }
    }
}

impl LadderConfig {
    /// Validates the configured starting tier and rating parameters.
    ///
    /// # Errors
    /// Returns [`LadderError::Configuration`] when the default starting
    /// rating is not one of the starting tiers or the Elo parameters are
    /// invalid.
    pub fn validate(&self) -> Result<(), LadderError> {
        if StartingTier::from_rating(self.default_starting_rating).is_none() {
            let allowed = StartingTier::ALL
                .iter()
                .map(|tier| tier.rating().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(LadderError::Configuration(format!(
                "default_starting_rating MUST be one of {allowed}"
            )));
        }

        self.elo.validate()
    }

    /// Starting tier matching `default_starting_rating`.
    #[must_use]
    pub fn default_tier(&self) -> StartingTier {
        StartingTier::from_rating(self.default_starting_rating).unwrap_or_default()
    }

    /// Decodes and validates a configuration from JSON. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`LadderError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, LadderError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LadderError::Configuration(format!("invalid configuration JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddPlayer {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(
        default,
        alias = "startingRating",
        deserialize_with = "lenient_rating",
        skip_serializing_if = "Option::is_none"
    )]
    pub elo: Option<i64>,
    #[serde(
        default,
        serialize_with = "time::serde::rfc3339::option::serialize",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogMatch {
    #[serde(default, deserialize_with = "lenient_string")]
    pub player1_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub player2_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub winner: String,
    #[serde(
        default,
        serialize_with = "time::serde::rfc3339::option::serialize",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
}

// Payload fields are read leniently: a null or mistyped value falls back to
// the field default instead of rejecting the whole log.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => value,
        _ => String::new(),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn lenient_rating<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let rating = match Value::deserialize(deserializer)? {
        Value::Number(number) => match number.as_i64() {
            Some(whole) => Some(whole),
            None => number
                .as_f64()
                .filter(|value| value.is_finite())
                .map(|value| round_half_up(value) as i64),
        },
        _ => None,
    };
    Ok(rating)
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => parse_timestamp_lenient(&value),
        _ => None,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "ADD_PLAYER")]
    AddPlayer(AddPlayer),
    #[serde(rename = "LOG_MATCH")]
    LogMatch(LogMatch),
}

impl Event {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AddPlayer(_) => EVENT_TYPE_ADD_PLAYER,
            Self::LogMatch(_) => EVENT_TYPE_LOG_MATCH,
        }
    }
}

/// Ordered, append-only sequence of events. The only persisted state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_events(events: Vec<Event>) -> Self {
        Self { events }
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchScore {
    Win,
    Draw,
    Loss,
}

impl MatchScore {
    #[must_use]
    pub fn value(self) -> f64 {
        match self {
            Self::Win => 1.0,
            Self::Draw => 0.5,
            Self::Loss => 0.0,
        }
    }

    /// Score for player 1. Anything that names neither player counts as a draw.
    #[must_use]
    pub fn from_winner(winner: &str, player1: &str, player2: &str) -> Self {
        if winner == player1 {
            Self::Win
        } else if winner == player2 {
            Self::Loss
        } else {
            Self::Draw
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MatchUpdate {
    pub change1: f64,
    pub change2: f64,
}

/// Logistic expected score of player 1 against player 2.
#[must_use]
pub fn expected_score(rating1: f64, rating2: f64) -> f64 {
    1.0 / (1.0 + 10_f64.powf((rating2 - rating1) / 400.0))
}

/// Rounds to the nearest integer with halves going towards positive infinity.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn round_half_up(value: f64) -> f64 {
    let rounded = value.round();
    if (rounded - value).abs() == 0.5 {
        value.ceil()
    } else {
        rounded
    }
}

/// Rating changes for a single match. Each side moves by its own K-factor,
/// so the two changes need not cancel out.
#[must_use]
pub fn compute_match_update(
    params: &EloParameters,
    rating1: f64,
    rating2: f64,
    matches_played1: u32,
    matches_played2: u32,
    score1: MatchScore,
) -> MatchUpdate {
    let k1 = params.k_factor(matches_played1);
    let k2 = params.k_factor(matches_played2);
    let performance_delta = score1.value() - expected_score(rating1, rating2);

    MatchUpdate {
        change1: round_half_up(k1 * performance_delta),
        change2: round_half_up(k2 * -performance_delta),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    pub name: String,
    pub rating: f64,
    pub matches_played: u32,
    pub winstreak: u32,
    pub rating_history: Vec<f64>,
}

impl Player {
    fn new(name: String, rating: f64) -> Self {
        Self {
            name,
            rating,
            matches_played: 0,
            winstreak: 0,
            rating_history: Vec::new(),
        }
    }

    fn record(&mut self, new_rating: f64) {
        self.rating = new_rating;
        self.matches_played += 1;
        self.rating_history.push(new_rating);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchSide {
    pub name: String,
    pub old_rating: f64,
    pub new_rating: f64,
    pub change: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HeadToHeadTally {
    pub player1_wins: u32,
    pub player2_wins: u32,
    pub draws: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub player1: MatchSide,
    pub player2: MatchSide,
    pub winner: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
    /// Running tally between the two participants, this match included.
    pub h2h_after: HeadToHeadTally,
}

impl MatchRecord {
    #[must_use]
    pub fn involves(&self, name: &str) -> bool {
        self.player1.name == name || self.player2.name == name
    }

    #[must_use]
    pub fn is_draw(&self) -> bool {
        self.winner != self.player1.name && self.winner != self.player2.name
    }
}

/// Aggregate record of one unordered pairing. `first` sorts before `second`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HeadToHeadRecord {
    pub first: String,
    pub second: String,
    pub first_wins: u32,
    pub second_wins: u32,
    pub draws: u32,
}

impl HeadToHeadRecord {
    fn new(first: String, second: String) -> Self {
        Self {
            first,
            second,
            first_wins: 0,
            second_wins: 0,
            draws: 0,
        }
    }

    fn tally(&mut self, winner: &str) {
        if winner == self.first {
            self.first_wins += 1;
        } else if winner == self.second {
            self.second_wins += 1;
        } else {
            self.draws += 1;
        }
    }

    /// Decisive results only.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.first_wins + self.second_wins
    }

    /// Views the record from `player`'s side. Returns `None` when `player`
    /// is not part of this pairing.
    #[must_use]
    pub fn oriented(&self, player: &str) -> Option<HeadToHead> {
        if player == self.first {
            Some(HeadToHead {
                player: self.first.clone(),
                opponent: self.second.clone(),
                player_wins: self.first_wins,
                opponent_wins: self.second_wins,
                draws: self.draws,
            })
        } else if player == self.second {
            Some(HeadToHead {
                player: self.second.clone(),
                opponent: self.first.clone(),
                player_wins: self.second_wins,
                opponent_wins: self.first_wins,
                draws: self.draws,
            })
        } else {
            None
        }
    }

    fn tally_for(&self, player1: &str) -> HeadToHeadTally {
        match self.oriented(player1) {
            Some(view) => HeadToHeadTally {
                player1_wins: view.player_wins,
                player2_wins: view.opponent_wins,
                draws: view.draws,
            },
            None => HeadToHeadTally::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HeadToHead {
    pub player: String,
    pub opponent: String,
    pub player_wins: u32,
    pub opponent_wins: u32,
    pub draws: u32,
}

impl HeadToHead {
    /// Decisive results only.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.player_wins + self.opponent_wins
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rankings {
    pub all_by_matches: Vec<String>,
    pub ranked_by_rating: Vec<String>,
    pub ranked_by_matches: Vec<String>,
    pub other_by_matches: Vec<String>,
}

/// Data-quality counters collected while replaying a log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DerivationDiagnostics {
    pub skipped_matches: usize,
    pub ignored_players: usize,
    pub nonstandard_winners: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MaterializedView {
    /// Players in creation order.
    pub players: Vec<Player>,
    pub matches: Vec<MatchRecord>,
    pub rankings: Rankings,
    /// One record per pairing with at least one decisive result, ordered by
    /// the normalized name pair. Draws between the pair are still counted.
    pub head_to_head: Vec<HeadToHeadRecord>,
    pub diagnostics: DerivationDiagnostics,
}

impl MaterializedView {
    #[must_use]
    pub fn player(&self, name: &str) -> Option<&Player> {
        self.players.iter().find(|player| player.name == name)
    }

    /// Case-insensitive membership, as used for new-player uniqueness.
    #[must_use]
    pub fn has_player_folded(&self, name: &str) -> bool {
        let folded = name.to_lowercase();
        self.players
            .iter()
            .any(|player| player.name.to_lowercase() == folded)
    }

    #[must_use]
    pub fn players_named(&self, names: &[String]) -> Vec<&Player> {
        names.iter().filter_map(|name| self.player(name)).collect()
    }

    #[must_use]
    pub fn ranked_players(&self) -> Vec<&Player> {
        self.players_named(&self.rankings.ranked_by_rating)
    }

    #[must_use]
    pub fn all_players_by_matches(&self) -> Vec<&Player> {
        self.players_named(&self.rankings.all_by_matches)
    }

    /// 1-based position in the rating ranking.
    #[must_use]
    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.rankings
            .ranked_by_rating
            .iter()
            .position(|ranked| ranked == name)
            .map(|index| index + 1)
    }

    #[must_use]
    pub fn matches_for(&self, name: &str) -> Vec<&MatchRecord> {
        self.matches
            .iter()
            .filter(|record| record.involves(name))
            .collect()
    }

    #[must_use]
    pub fn head_to_head(&self, player: &str, opponent: &str) -> Option<HeadToHead> {
        let (first, second) = pair_key(player, opponent);
        self.head_to_head
            .iter()
            .find(|record| record.first == first && record.second == second)
            .and_then(|record| record.oriented(player))
    }

    /// Every pairing of `player`, oriented towards them, most decisive
    /// results first.
    #[must_use]
    pub fn head_to_head_for(&self, player: &str) -> Vec<HeadToHead> {
        let mut records = self
            .head_to_head
            .iter()
            .filter_map(|record| record.oriented(player))
            .collect::<Vec<_>>();
        records.sort_by(|lhs, rhs| rhs.total().cmp(&lhs.total()));
        records
    }
}

fn pair_key<'a>(lhs: &'a str, rhs: &'a str) -> (&'a str, &'a str) {
    if lhs <= rhs {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    }
}

/// Replays `log` into a fully materialized view.
///
/// Content problems never fail the replay: additions with an empty or
/// already taken (case-insensitive) name are ignored, matches naming an
/// unknown player or a player against themselves are skipped, and
/// unrecognized winners are scored as draws. All of these are counted in
/// [`MaterializedView::diagnostics`].
#[must_use]
#[allow(clippy::too_many_lines, clippy::cast_precision_loss)]
pub fn derive_state(log: &EventLog, config: &LadderConfig) -> MaterializedView {
    let mut players: Vec<Player> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut folded_names: HashSet<String> = HashSet::new();
    let mut matches: Vec<MatchRecord> = Vec::new();
    let mut pairings: BTreeMap<(String, String), HeadToHeadRecord> = BTreeMap::new();
    let mut diagnostics = DerivationDiagnostics::default();

    for (position, event) in log.iter().enumerate() {
        match event {
            Event::AddPlayer(add) => {
                if add.name.is_empty() || !folded_names.insert(add.name.to_lowercase()) {
                    diagnostics.ignored_players += 1;
                    tracing::debug!(position, name = %add.name, "ignoring player addition");
                    continue;
                }

                let rating = match add.elo {
                    Some(elo) if elo != 0 => elo as f64,
                    _ => config.default_starting_rating,
                };
                index.insert(add.name.clone(), players.len());
                players.push(Player::new(add.name.clone(), rating));
            }
            Event::LogMatch(entry) => {
                let (Some(&slot1), Some(&slot2)) = (
                    index.get(&entry.player1_name),
                    index.get(&entry.player2_name),
                ) else {
                    diagnostics.skipped_matches += 1;
                    tracing::debug!(
                        position,
                        player1 = %entry.player1_name,
                        player2 = %entry.player2_name,
                        "skipping match with unknown player"
                    );
                    continue;
                };

                if slot1 == slot2 {
                    diagnostics.skipped_matches += 1;
                    tracing::debug!(position, player = %entry.player1_name, "skipping self match");
                    continue;
                }

                let score1 =
                    MatchScore::from_winner(&entry.winner, &entry.player1_name, &entry.player2_name);
                if score1 == MatchScore::Draw && entry.winner != DRAW {
                    diagnostics.nonstandard_winners += 1;
                    tracing::debug!(position, winner = %entry.winner, "scoring unrecognized winner as draw");
                }

                let old_rating1 = players[slot1].rating;
                let old_rating2 = players[slot2].rating;
                let update = compute_match_update(
                    &config.elo,
                    old_rating1,
                    old_rating2,
                    players[slot1].matches_played,
                    players[slot2].matches_played,
                    score1,
                );

                let new_rating1 = round_half_up(old_rating1 + update.change1);
                let new_rating2 = round_half_up(old_rating2 + update.change2);
                players[slot1].record(new_rating1);
                players[slot2].record(new_rating2);

                let (first, second) = pair_key(&entry.player1_name, &entry.player2_name);
                let pairing = pairings
                    .entry((first.to_string(), second.to_string()))
                    .or_insert_with(|| HeadToHeadRecord::new(first.to_string(), second.to_string()));
                pairing.tally(&entry.winner);
                let h2h_after = pairing.tally_for(&entry.player1_name);

                matches.push(MatchRecord {
                    player1: MatchSide {
                        name: entry.player1_name.clone(),
                        old_rating: old_rating1,
                        new_rating: new_rating1,
                        change: update.change1,
                    },
                    player2: MatchSide {
                        name: entry.player2_name.clone(),
                        old_rating: old_rating2,
                        new_rating: new_rating2,
                        change: update.change2,
                    },
                    winner: entry.winner.clone(),
                    timestamp: entry.timestamp,
                    h2h_after,
                });
            }
        }
    }

    let streaks = winstreaks(&matches);
    for player in &mut players {
        player.winstreak = streaks.get(player.name.as_str()).copied().unwrap_or(0);
    }

    let rankings = partition(&players, config.ranking_min_matches);

    MaterializedView {
        players,
        matches,
        rankings,
        head_to_head: pairings
            .into_values()
            .filter(|pairing| pairing.total() > 0)
            .collect(),
        diagnostics,
    }
}

// Walks matches newest first; a player's streak is settled by their first
// non-win.
fn winstreaks(matches: &[MatchRecord]) -> HashMap<&str, u32> {
    let mut streaks: HashMap<&str, u32> = HashMap::new();
    let mut settled: HashSet<&str> = HashSet::new();

    for record in matches.iter().rev() {
        for name in [record.player1.name.as_str(), record.player2.name.as_str()] {
            if settled.contains(name) {
                continue;
            }
            if record.winner == name {
                *streaks.entry(name).or_insert(0) += 1;
            } else {
                settled.insert(name);
            }
        }
    }

    streaks
}

fn partition(players: &[Player], ranking_min_matches: u32) -> Rankings {
    let mut by_matches = (0..players.len()).collect::<Vec<_>>();
    by_matches.sort_by(|lhs, rhs| players[*rhs].matches_played.cmp(&players[*lhs].matches_played));

    let (ranked, other): (Vec<usize>, Vec<usize>) = by_matches
        .iter()
        .partition(|slot| players[**slot].matches_played >= ranking_min_matches);

    let mut by_rating = ranked.clone();
    by_rating.sort_by(|lhs, rhs| players[*rhs].rating.total_cmp(&players[*lhs].rating));

    let names = |slots: &[usize]| {
        slots
            .iter()
            .map(|slot| players[*slot].name.clone())
            .collect::<Vec<_>>()
    };

    Rankings {
        all_by_matches: names(&by_matches),
        ranked_by_rating: names(&by_rating),
        ranked_by_matches: names(&ranked),
        other_by_matches: names(&other),
    }
}

/// Match entry of the legacy match-list export, which carries no player
/// creation events.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMatch {
    pub player1_name: String,
    pub player2_name: String,
    pub winner: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacySide {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct NestedLegacyMatch {
    player1: LegacySide,
    player2: LegacySide,
    winner: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LegacyEntry {
    Lean(LegacyMatch),
    Nested(NestedLegacyMatch),
}

impl From<LegacyEntry> for LegacyMatch {
    fn from(entry: LegacyEntry) -> Self {
        match entry {
            LegacyEntry::Lean(lean) => lean,
            LegacyEntry::Nested(nested) => Self {
                player1_name: nested.player1.name,
                player2_name: nested.player2.name,
                winner: nested.winner,
                timestamp: nested.timestamp,
            },
        }
    }
}

/// Serializes the log as a pretty-printed canonical event array.
///
/// # Errors
/// Returns [`LadderError::Format`] when serialization fails.
pub fn serialize_log(log: &EventLog) -> Result<Vec<u8>, LadderError> {
    serde_json::to_vec_pretty(log)
        .map_err(|err| LadderError::Format(format!("failed to serialize event log: {err}")))
}

/// Match list of `log` in the legacy export shape.
///
/// # Errors
/// Returns [`LadderError::Format`] when a timestamp cannot be formatted.
pub fn export_legacy(log: &EventLog) -> Result<Vec<LegacyMatch>, LadderError> {
    log.iter()
        .filter_map(|event| match event {
            Event::LogMatch(entry) => Some(entry),
            Event::AddPlayer(_) => None,
        })
        .map(|entry| -> Result<LegacyMatch, LadderError> {
            let timestamp = entry
                .timestamp
                .map(format_rfc3339)
                .transpose()
                .map_err(|err| LadderError::Format(err.to_string()))?;
            Ok(LegacyMatch {
                player1_name: entry.player1_name.clone(),
                player2_name: entry.player2_name.clone(),
                winner: entry.winner.clone(),
                timestamp,
            })
        })
        .collect()
}

/// Serializes the legacy match list as pretty-printed JSON.
///
/// # Errors
/// Returns [`LadderError::Format`] when serialization fails.
pub fn serialize_legacy(log: &EventLog) -> Result<Vec<u8>, LadderError> {
    let entries = export_legacy(log)?;
    serde_json::to_vec_pretty(&entries)
        .map_err(|err| LadderError::Format(format!("failed to serialize match list: {err}")))
}

/// Parses an import file into an event log.
///
/// Accepts the canonical event array and the legacy match list (lean or
/// nested player objects). Legacy players are created with the default
/// rating in order of first appearance, then matches follow in ascending
/// timestamp order; entries without a usable timestamp keep their relative
/// order ahead of timestamped ones.
///
/// # Errors
/// Returns [`LadderError::Format`] when the input is not JSON, not an
/// array, or contains an entry matching neither shape.
pub fn parse_import(bytes: &[u8]) -> Result<EventLog, LadderError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| LadderError::Format(format!("import is not valid JSON: {err}")))?;

    let Value::Array(items) = value else {
        return Err(LadderError::Format(
            "import MUST be a JSON array".to_string(),
        ));
    };

    if items.iter().all(|item| item.get("type").is_some()) {
        let events = items
            .into_iter()
            .enumerate()
            .map(|(position, item)| {
                serde_json::from_value::<Event>(item).map_err(|err| {
                    LadderError::Format(format!("entry {position} is not a recognized event: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(EventLog::from_events(events));
    }

    let entries = items
        .into_iter()
        .enumerate()
        .map(|(position, item)| {
            serde_json::from_value::<LegacyEntry>(item)
                .map(LegacyMatch::from)
                .map_err(|err| {
                    LadderError::Format(format!(
                        "entry {position} is neither an event nor a legacy match: {err}"
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(log_from_legacy(entries))
}

fn log_from_legacy(entries: Vec<LegacyMatch>) -> EventLog {
    let mut timed = entries
        .into_iter()
        .map(|entry| {
            let at = entry.timestamp.as_deref().and_then(parse_timestamp_lenient);
            (at, entry)
        })
        .collect::<Vec<_>>();
    timed.sort_by_key(|(at, _)| *at);

    let mut seen = HashSet::new();
    let mut events = Vec::new();
    for (_, entry) in &timed {
        for name in [&entry.player1_name, &entry.player2_name] {
            if !name.is_empty() && seen.insert(name.clone()) {
                events.push(Event::AddPlayer(AddPlayer {
                    name: name.clone(),
                    elo: None,
                    timestamp: None,
                }));
            }
        }
    }

    events.extend(timed.into_iter().map(|(at, entry)| {
        Event::LogMatch(LogMatch {
            player1_name: entry.player1_name,
            player2_name: entry.player2_name,
            winner: entry.winner,
            timestamp: at,
        })
    }));

    EventLog::from_events(events)
}

fn parse_timestamp_lenient(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
}

/// Storage seam for the event log.
pub trait EventLogStore {
    type Error: From<LadderError>;

    /// Loads the full log.
    ///
    /// # Errors
    /// Returns the store's error when the log cannot be read.
    fn load(&self) -> Result<EventLog, Self::Error>;

    /// Replaces the stored log with `log`.
    ///
    /// # Errors
    /// Returns the store's error when the log cannot be written.
    fn save(&mut self, log: &EventLog) -> Result<(), Self::Error>;

    /// Persists one appended event. `log` already ends with `event`.
    ///
    /// # Errors
    /// Returns the store's error when the event cannot be written.
    fn append(&mut self, _event: &Event, log: &EventLog) -> Result<(), Self::Error> {
        self.save(log)
    }

    /// Removes every stored event.
    ///
    /// # Errors
    /// Returns the store's error when the log cannot be cleared.
    fn clear(&mut self) -> Result<(), Self::Error> {
        self.save(&EventLog::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventLogStore {
    log: EventLog,
}

impl MemoryEventLogStore {
    #[must_use]
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl EventLogStore for MemoryEventLogStore {
    type Error = LadderError;

    fn load(&self) -> Result<EventLog, Self::Error> {
        Ok(self.log.clone())
    }

    fn save(&mut self, log: &EventLog) -> Result<(), Self::Error> {
        self.log = log.clone();
        Ok(())
    }
}

/// Owns the event log and performs validated writes against a store.
///
/// Every write builds the next log, persists it, and only then replaces the
/// in-memory log, so a rejected or failed write leaves the session as it was.
#[derive(Debug)]
pub struct LadderSession<S> {
    store: S,
    log: EventLog,
    config: LadderConfig,
}

impl<S: EventLogStore> LadderSession<S> {
    /// Loads the log from `store`.
    ///
    /// # Errors
    /// Returns an error when `config` is invalid or the store cannot load.
    pub fn open(store: S, config: LadderConfig) -> Result<Self, S::Error> {
        config.validate()?;
        let log = store.load()?;
        tracing::debug!(events = log.len(), "loaded event log");
        Ok(Self { store, log, config })
    }

    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    #[must_use]
    pub fn config(&self) -> &LadderConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn view(&self) -> MaterializedView {
        derive_state(&self.log, &self.config)
    }

    /// Appends an `ADD_PLAYER` event. The name is trimmed; a missing tier
    /// falls back to the configured default.
    ///
    /// # Errors
    /// Returns [`LadderError::Validation`] for an empty name or a name that
    /// already exists ignoring case, or the store's error on write failure.
    pub fn add_player(
        &mut self,
        name: &str,
        tier: Option<StartingTier>,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<AddPlayer, S::Error> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LadderError::Validation("player name cannot be empty".to_string()).into());
        }

        if self.view().has_player_folded(name) {
            return Err(LadderError::Validation(format!(
                "a player named {name} already exists"
            ))
            .into());
        }

        let payload = AddPlayer {
            name: name.to_string(),
            elo: Some(tier.unwrap_or_else(|| self.config.default_tier()).rating()),
            timestamp,
        };
        self.append(Event::AddPlayer(payload.clone()))?;
        tracing::info!(name = %payload.name, elo = ?payload.elo, "player added");
        Ok(payload)
    }

    /// Appends a `LOG_MATCH` event between two existing, distinct players.
    ///
    /// # Errors
    /// Returns [`LadderError::Validation`] when a field is empty, both sides
    /// name the same player, a player does not exist, or the winner is
    /// neither participant nor [`DRAW`]; the store's error on write failure.
    pub fn log_match(
        &mut self,
        player1: &str,
        player2: &str,
        winner: &str,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<LogMatch, S::Error> {
        if player1.is_empty() || player2.is_empty() || winner.is_empty() {
            return Err(LadderError::Validation(
                "please complete all fields for the match".to_string(),
            )
            .into());
        }

        if player1 == player2 {
            return Err(LadderError::Validation(
                "a player cannot play against themselves".to_string(),
            )
            .into());
        }

        let view = self.view();
        for name in [player1, player2] {
            if view.player(name).is_none() {
                return Err(LadderError::Validation(format!("unknown player: {name}")).into());
            }
        }

        if winner != player1 && winner != player2 && winner != DRAW {
            return Err(LadderError::Validation(format!(
                "winner MUST be {player1}, {player2} or {DRAW}"
            ))
            .into());
        }

        let payload = LogMatch {
            player1_name: player1.to_string(),
            player2_name: player2.to_string(),
            winner: winner.to_string(),
            timestamp,
        };
        self.append(Event::LogMatch(payload.clone()))?;
        tracing::info!(player1, player2, winner, "match logged");
        Ok(payload)
    }

    /// Replaces the whole log with the parsed contents of an import file.
    /// Returns the number of imported events.
    ///
    /// # Errors
    /// Returns [`LadderError::Format`] for unreadable input, or the store's
    /// error on write failure. The current log is kept in both cases.
    pub fn import(&mut self, bytes: &[u8]) -> Result<usize, S::Error> {
        let log = parse_import(bytes)?;
        let count = log.len();
        self.replace(log)?;
        Ok(count)
    }

    /// Replaces the whole log.
    ///
    /// # Errors
    /// Returns the store's error on write failure.
    pub fn replace(&mut self, log: EventLog) -> Result<(), S::Error> {
        self.store.save(&log)?;
        tracing::info!(events = log.len(), "event log replaced");
        self.log = log;
        Ok(())
    }

    /// Clears the log.
    ///
    /// # Errors
    /// Returns the store's error on write failure.
    pub fn reset(&mut self) -> Result<(), S::Error> {
        self.store.clear()?;
        tracing::info!(discarded = self.log.len(), "event log cleared");
        self.log = EventLog::new();
        Ok(())
    }

    /// # Errors
    /// Returns [`LadderError::Format`] when serialization fails.
    pub fn export(&self) -> Result<Vec<u8>, LadderError> {
        serialize_log(&self.log)
    }

    /// # Errors
    /// Returns [`LadderError::Format`] when serialization fails.
    pub fn export_legacy(&self) -> Result<Vec<u8>, LadderError> {
        serialize_legacy(&self.log)
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn append(&mut self, event: Event) -> Result<(), S::Error> {
        let mut next = self.log.clone();
        next.push(event.clone());
        self.store.append(&event, &next)?;
        self.log = next;
        Ok(())
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LadderError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LadderError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LadderError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LadderError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LadderError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LadderError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LadderError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
