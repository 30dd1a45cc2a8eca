//! Harvested row model
//!
//! A [`Row`] is an open mapping from column name to value. The twelve
//! [`FixedColumn`]s are always part of the persisted header; participant
//! columns (one per voting member state) are added as they are observed, so
//! the full schema is only known when rows are merged into the store.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::link::CanonicalLink;

/// Core schema, in persisted order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixedColumn {
    Council,
    Date,
    Title,
    Resolution,
    TotalVotes,
    NoVoteCount,
    AbsentCount,
    NoCount,
    YesCount,
    Link,
    Token,
    ScrapeYear,
}

impl FixedColumn {
    pub const ALL: [FixedColumn; 12] = [
        FixedColumn::Council,
        FixedColumn::Date,
        FixedColumn::Title,
        FixedColumn::Resolution,
        FixedColumn::TotalVotes,
        FixedColumn::NoVoteCount,
        FixedColumn::AbsentCount,
        FixedColumn::NoCount,
        FixedColumn::YesCount,
        FixedColumn::Link,
        FixedColumn::Token,
        FixedColumn::ScrapeYear,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            FixedColumn::Council => "Council",
            FixedColumn::Date => "Date",
            FixedColumn::Title => "Title",
            FixedColumn::Resolution => "Resolution",
            FixedColumn::TotalVotes => "TOTAL VOTES",
            FixedColumn::NoVoteCount => "NO-VOTE COUNT",
            FixedColumn::AbsentCount => "ABSENT COUNT",
            FixedColumn::NoCount => "NO COUNT",
            FixedColumn::YesCount => "YES COUNT",
            FixedColumn::Link => "Link",
            FixedColumn::Token => "token",
            FixedColumn::ScrapeYear => "Scrape_Year",
        }
    }

    /// Header names of the core schema
    pub fn names() -> impl Iterator<Item = &'static str> {
        Self::ALL.iter().map(|c| c.as_str())
    }

    pub fn is_fixed(column: &str) -> bool {
        Self::names().any(|name| name == column)
    }
}

/// Institution inferred from a resolution title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Council {
    SecurityCouncil,
    GeneralAssembly,
    Unknown,
}

impl Council {
    pub fn infer(title: &str) -> Self {
        if title.is_empty() {
            return Council::Unknown;
        }
        let lower = title.to_lowercase();
        if lower.contains("security council") || title.contains("S/RES/") {
            Council::SecurityCouncil
        } else if lower.contains("general assembly") || title.contains("A/RES/") {
            Council::GeneralAssembly
        } else {
            Council::Unknown
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Council::SecurityCouncil => "Security Council",
            Council::GeneralAssembly => "General Assembly",
            Council::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Council {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 참가국별 투표 값
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteCode {
    Yes,
    No,
    Abstain,
}

impl VoteCode {
    /// Single-letter code used on the detail page (`Y`, `N`, `A`)
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "Y" => Some(VoteCode::Yes),
            "N" => Some(VoteCode::No),
            "A" => Some(VoteCode::Abstain),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VoteCode::Yes => "YES",
            VoteCode::No => "NO",
            VoteCode::Abstain => "ABSTAIN",
        }
    }
}

static YES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Yes:\s*(\d+)").unwrap());
static NO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"No:\s*(\d+)").unwrap());
static ABSTAIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Abstentions:\s*(\d+)").unwrap());
static NON_VOTING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Non-Voting:\s*(\d+)").unwrap());
static TOTAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Total voting membership:\s*(\d+)").unwrap());

/// Tallies parsed from a "Vote summary" text block; absent labels stay `None`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub yes: Option<u32>,
    pub no: Option<u32>,
    pub abstentions: Option<u32>,
    pub non_voting: Option<u32>,
    pub total_membership: Option<u32>,
}

impl VoteTally {
    pub fn parse(summary: &str) -> Self {
        let capture = |re: &Regex| {
            re.captures(summary)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
        };
        Self {
            yes: capture(&YES_RE),
            no: capture(&NO_RE),
            abstentions: capture(&ABSTAIN_RE),
            non_voting: capture(&NON_VOTING_RE),
            total_membership: capture(&TOTAL_RE),
        }
    }
}

/// One harvested record, keyed by column name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    values: BTreeMap<String, String>,
}

impl Row {
    /// Fresh row carrying the identity columns of `link` within `partition`
    pub fn for_link(link: &CanonicalLink, partition: &str) -> Self {
        let mut row = Self::default();
        row.set(FixedColumn::Link, link.as_str());
        row.set(FixedColumn::Token, link.token());
        row.set(FixedColumn::ScrapeYear, partition);
        row
    }

    /// Row loaded back from the store (any column set)
    pub fn from_columns(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, column: FixedColumn, value: impl Into<String>) {
        self.values.insert(column.as_str().to_string(), value.into());
    }

    /// Participant columns never shadow a core column; returns false when rejected
    pub fn set_participant(&mut self, participant: &str, vote: VoteCode) -> bool {
        let participant = participant.trim();
        if participant.is_empty() || FixedColumn::is_fixed(participant) {
            return false;
        }
        self.values
            .insert(participant.to_string(), vote.as_str().to_string());
        true
    }

    pub fn apply_tally(&mut self, tally: &VoteTally) {
        let pairs = [
            (FixedColumn::YesCount, tally.yes),
            (FixedColumn::NoCount, tally.no),
            (FixedColumn::AbsentCount, tally.abstentions),
            (FixedColumn::NoVoteCount, tally.non_voting),
            (FixedColumn::TotalVotes, tally.total_membership),
        ];
        for (column, value) in pairs {
            if let Some(value) = value {
                self.set(column, value.to_string());
            }
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn fixed(&self, column: FixedColumn) -> Option<&str> {
        self.get(column.as_str())
    }

    /// A row with neither title nor resolution id is parse noise
    pub fn is_meaningful(&self) -> bool {
        let present = |c| self.fixed(c).is_some_and(|v| !v.trim().is_empty());
        present(FixedColumn::Title) || present(FixedColumn::Resolution)
    }

    /// Composite dedup key: token + link when both exist, else whichever exists
    pub fn dedup_key(&self) -> Option<String> {
        let token = self.fixed(FixedColumn::Token).map(str::trim).filter(|v| !v.is_empty());
        let link = self.fixed(FixedColumn::Link).map(str::trim).filter(|v| !v.is_empty());
        match (token, link) {
            (Some(token), Some(link)) => Some(format!("{token}_{link}")),
            (Some(token), None) => Some(token.to_string()),
            (None, Some(link)) => Some(link.to_string()),
            (None, None) => None,
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Columns outside the core schema
    pub fn extra_columns(&self) -> impl Iterator<Item = &str> {
        self.columns().filter(|c| !FixedColumn::is_fixed(c))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
