//! Catalog-backed records: tasks, arbitrage transactions, executions,
//! worker liveness.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Amount, BookDepth, MarketKind, Pair, Price, Side, VenueId};

/// Desired-state entry for the Monitor role, one row per
/// (monitoring config, pair) join result.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MonitorTask {
    pub id: i64,
    pub owner_id: i64,
    pub venue: VenueId,
    pub venue_name: String,
    pub market: MarketKind,
    pub pair_id: i64,
    pub pair: Pair,
    pub depth: BookDepth,
    pub batch_size: usize,
    pub batch_interval_sec: u64,
    pub ring_capacity: usize,
    pub save_interval_sec: u64,
}

/// Per-trade risk limits loaded from the TRADE row.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RiskLimits {
    pub max_amount: Amount,
    pub max_open_orders: u32,
    pub max_position: Amount,
    pub slippage_pct: Decimal,
    pub fin_protection: bool,
    pub bbo_only: bool,
    pub update_interval_sec: u64,
}

/// Closed set of strategy kinds. The integer codes come from
/// `TRADE.type`; anything unrecognized is carried as `Unknown` and
/// never scheduled.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StrategyKind {
    Grid,
    Dca,
    Scalp,
    Arbitrage,
    Unknown(i64),
}

impl StrategyKind {
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Grid,
            2 => Self::Dca,
            3 => Self::Scalp,
            6 => Self::Arbitrage,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Grid => 1,
            Self::Dca => 2,
            Self::Scalp => 3,
            Self::Arbitrage => 6,
            Self::Unknown(code) => code,
        }
    }

    #[must_use]
    pub fn is_schedulable(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// Desired-state entry for the Trader role.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TradeTask {
    pub id: i64,
    pub owner_id: i64,
    pub strategy: StrategyKind,
    pub venue: VenueId,
    pub market: MarketKind,
    pub pair_id: i64,
    pub pair: Pair,
    pub account_id: i64,
    pub strategy_params: serde_json::Value,
    pub risk: RiskLimits,
}

/// Lifecycle of one cross-venue arbitrage round trip. Integer codes
/// match the catalog's status enum.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ArbitrageStatus {
    New,
    InProgress,
    Suspend,
    Error,
    Complete,
    CompleteLoss,
    ErrorApproved,
    CompleteLossApproved,
}

impl ArbitrageStatus {
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::New),
            2 => Some(Self::InProgress),
            3 => Some(Self::Suspend),
            4 => Some(Self::Error),
            5 => Some(Self::Complete),
            6 => Some(Self::CompleteLoss),
            7 => Some(Self::ErrorApproved),
            8 => Some(Self::CompleteLossApproved),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::New => 1,
            Self::InProgress => 2,
            Self::Suspend => 3,
            Self::Error => 4,
            Self::Complete => 5,
            Self::CompleteLoss => 6,
            Self::ErrorApproved => 7,
            Self::CompleteLossApproved => 8,
        }
    }

    /// Whether a transition is allowed. Each lane is one-way: work
    /// advances New → InProgress → terminal, operators approve
    /// terminal-with-loss states, and recovery moves Suspend back to
    /// New or forward to Error.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use ArbitrageStatus::*;
        matches!(
            (self, to),
            (New, InProgress)
                | (InProgress, Complete)
                | (InProgress, CompleteLoss)
                | (InProgress, Error)
                | (InProgress, Suspend)
                | (Error, ErrorApproved)
                | (CompleteLoss, CompleteLossApproved)
                | (Suspend, New)
                | (Suspend, Error)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::CompleteLoss | Self::Error | Self::ErrorApproved
                | Self::CompleteLossApproved
        )
    }
}

impl fmt::Display for ArbitrageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Suspend => "suspend",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::CompleteLoss => "complete_loss",
            Self::ErrorApproved => "error_approved",
            Self::CompleteLossApproved => "complete_loss_approved",
        };
        f.write_str(name)
    }
}

/// One persisted arbitrage round trip.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ArbitrageTransaction {
    pub id: i64,
    pub trade_id: i64,
    pub status: ArbitrageStatus,
    /// Actually filled quantity; written on terminal transitions only.
    pub amount: Option<Amount>,
    /// Realized delta minus commissions; written on terminal transitions only.
    pub calc_profit: Option<Decimal>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Fill status stored in TRADE_HISTORY.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ExecutionStatus {
    Pending,
    Filled,
    Partial,
    Cancelled,
}

impl ExecutionStatus {
    #[must_use]
    pub fn catalog_code(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Filled => "FILLED",
            Self::Partial => "PARTIAL",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "FILLED" => Ok(Self::Filled),
            "PARTIAL" => Ok(Self::Partial),
            "CANCELLED" | "CANCELED" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Immutable executed-order row batched into TRADE_HISTORY.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderExecution {
    pub trade_id: i64,
    pub venue_order_id: String,
    pub pair_id: i64,
    pub account_id: i64,
    pub side: Side,
    pub price: Price,
    pub qty: Amount,
    pub commission: Amount,
    pub commission_asset: String,
    /// Wall time at microsecond resolution.
    pub executed_micros: i64,
    pub status: ExecutionStatus,
    pub realized_pnl: Option<Decimal>,
}

/// Worker lifecycle as published in DAEMON_STATE.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl WorkerStatus {
    #[must_use]
    pub fn catalog_code(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown worker status '{other}'")),
        }
    }
}

/// Which halves of the system a worker runs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Monitor,
    Trader,
    Both,
}

impl WorkerRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Trader => "trader",
            Self::Both => "both",
        }
    }

    #[must_use]
    pub fn runs_monitor(self) -> bool {
        matches!(self, Self::Monitor | Self::Both)
    }

    #[must_use]
    pub fn runs_trader(self) -> bool {
        matches!(self, Self::Trader | Self::Both)
    }
}

impl FromStr for WorkerRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "monitor" => Ok(Self::Monitor),
            "trader" => Ok(Self::Trader),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown worker role '{other}'")),
        }
    }
}

/// One row of DAEMON_STATE: a worker's published presence.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WorkerState {
    pub id: i64,
    /// `hostname-pid`, unique per process instance.
    pub name: String,
    pub status: WorkerStatus,
    pub role: WorkerRole,
    pub last_heartbeat_micros: i64,
    pub active_monitor_id: Option<i64>,
    pub active_trade_id: Option<i64>,
    pub error_message: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// In-memory record of what one (venue, market) surface is subscribed to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Subscription {
    pub venue: VenueId,
    pub market: MarketKind,
    pub pairs: BTreeSet<Pair>,
    pub depth: BookDepth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_codes_round_trip() {
        for code in [1, 2, 3, 6, 99] {
            assert_eq!(StrategyKind::from_code(code).code(), code);
        }
        assert!(!StrategyKind::Unknown(42).is_schedulable());
        assert!(StrategyKind::Arbitrage.is_schedulable());
    }

    #[test]
    fn arbitrage_status_codes_round_trip() {
        for code in 1..=8 {
            let status = ArbitrageStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(ArbitrageStatus::from_code(0).is_none());
        assert!(ArbitrageStatus::from_code(9).is_none());
    }

    #[test]
    fn transitions_follow_one_way_lanes() {
        use ArbitrageStatus::*;
        assert!(New.can_transition(InProgress));
        assert!(InProgress.can_transition(Suspend));
        assert!(InProgress.can_transition(Complete));
        assert!(Suspend.can_transition(New));
        assert!(Suspend.can_transition(Error));
        assert!(Error.can_transition(ErrorApproved));
        assert!(CompleteLoss.can_transition(CompleteLossApproved));

        assert!(!InProgress.can_transition(New));
        assert!(!Complete.can_transition(New));
        assert!(!ErrorApproved.can_transition(Error));
        assert!(!New.can_transition(Complete));
    }

    #[test]
    fn terminal_states_are_marked() {
        assert!(ArbitrageStatus::Complete.is_terminal());
        assert!(ArbitrageStatus::Error.is_terminal());
        assert!(!ArbitrageStatus::Suspend.is_terminal());
        assert!(!ArbitrageStatus::InProgress.is_terminal());
    }

    #[test]
    fn roles_select_components() {
        assert!(WorkerRole::Both.runs_monitor());
        assert!(WorkerRole::Both.runs_trader());
        assert!(!WorkerRole::Monitor.runs_trader());
        assert!(!WorkerRole::Trader.runs_monitor());
    }
}
