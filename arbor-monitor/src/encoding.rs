//! Arrow schemas and batch builders for the analytics sink.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow::array::{ArrayRef, Decimal128Builder, StringBuilder, TimestampNanosecondBuilder, UInt64Builder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use once_cell::sync::Lazy;
use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;

use arbor_core::{MarketKind, Pair, PriceLevel, Side, VenueId};

const DECIMAL_PRECISION: u8 = 38;
const DECIMAL_SCALE: i8 = 18;

/// Whether a delta row upserts a level or removes it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LevelAction {
    Update,
    Delete,
}

impl LevelAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One order-book level change bound for the columnar store.
#[derive(Clone, Debug)]
pub struct DeltaRow {
    pub timestamp_ms: i64,
    pub venue: VenueId,
    pub market: MarketKind,
    pub pair: Pair,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub action: LevelAction,
}

/// One full book image; levels travel as JSON arrays.
#[derive(Clone, Debug)]
pub struct SnapshotRow {
    pub timestamp_ms: i64,
    pub venue: VenueId,
    pub market: MarketKind,
    pub pair: Pair,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub seq: u64,
}

fn decimal_builder(capacity: usize) -> Decimal128Builder {
    Decimal128Builder::with_capacity(capacity)
        .with_data_type(DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE))
}

fn timestamp_builder(capacity: usize) -> TimestampNanosecondBuilder {
    TimestampNanosecondBuilder::with_capacity(capacity)
        .with_data_type(DataType::Timestamp(TimeUnit::Nanosecond, None))
}

fn string_builder(capacity: usize) -> StringBuilder {
    StringBuilder::with_capacity(capacity, capacity.saturating_mul(16))
}

fn decimal_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE),
        false,
    )
}

fn timestamp_field(name: &str) -> Field {
    Field::new(name, DataType::Timestamp(TimeUnit::Nanosecond, None), false)
}

static DELTA_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    Arc::new(Schema::new(vec![
        timestamp_field("timestamp"),
        Field::new("venue", DataType::Utf8, false),
        Field::new("market", DataType::Utf8, false),
        Field::new("pair", DataType::Utf8, false),
        Field::new("side", DataType::Utf8, false),
        decimal_field("price"),
        decimal_field("amount"),
        Field::new("action", DataType::Utf8, false),
    ]))
});

static SNAPSHOT_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    Arc::new(Schema::new(vec![
        timestamp_field("timestamp"),
        Field::new("venue", DataType::Utf8, false),
        Field::new("market", DataType::Utf8, false),
        Field::new("pair", DataType::Utf8, false),
        Field::new("bids", DataType::Utf8, false),
        Field::new("asks", DataType::Utf8, false),
        Field::new("seq", DataType::UInt64, false),
    ]))
});

pub fn delta_schema() -> SchemaRef {
    DELTA_SCHEMA.clone()
}

pub fn snapshot_schema() -> SchemaRef {
    SNAPSHOT_SCHEMA.clone()
}

pub fn deltas_to_batch(rows: &[DeltaRow]) -> Result<RecordBatch> {
    let capacity = rows.len();
    let mut timestamps = timestamp_builder(capacity);
    let mut venues = string_builder(capacity);
    let mut markets = string_builder(capacity);
    let mut pairs = string_builder(capacity);
    let mut sides = string_builder(capacity);
    let mut prices = decimal_builder(capacity);
    let mut amounts = decimal_builder(capacity);
    let mut actions = string_builder(capacity);

    for row in rows {
        timestamps.append_value(millis_to_nanos(row.timestamp_ms));
        venues.append_value(row.venue.as_str());
        markets.append_value(row.market.as_str());
        pairs.append_value(row.pair.as_str());
        sides.append_value(match row.side {
            Side::Buy => "bid",
            Side::Sell => "ask",
        });
        prices.append_value(decimal_to_i128(row.price)?);
        amounts.append_value(decimal_to_i128(row.amount)?);
        actions.append_value(row.action.as_str());
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(timestamps.finish()),
        Arc::new(venues.finish()),
        Arc::new(markets.finish()),
        Arc::new(pairs.finish()),
        Arc::new(sides.finish()),
        Arc::new(prices.finish()),
        Arc::new(amounts.finish()),
        Arc::new(actions.finish()),
    ];
    RecordBatch::try_new(delta_schema(), columns).context("failed to build delta batch")
}

pub fn snapshots_to_batch(rows: &[SnapshotRow]) -> Result<RecordBatch> {
    let capacity = rows.len();
    let mut timestamps = timestamp_builder(capacity);
    let mut venues = string_builder(capacity);
    let mut markets = string_builder(capacity);
    let mut pairs = string_builder(capacity);
    let mut bids = string_builder(capacity);
    let mut asks = string_builder(capacity);
    let mut seqs = UInt64Builder::with_capacity(capacity);

    for row in rows {
        timestamps.append_value(millis_to_nanos(row.timestamp_ms));
        venues.append_value(row.venue.as_str());
        markets.append_value(row.market.as_str());
        pairs.append_value(row.pair.as_str());
        bids.append_value(levels_json(&row.bids)?);
        asks.append_value(levels_json(&row.asks)?);
        seqs.append_value(row.seq);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(timestamps.finish()),
        Arc::new(venues.finish()),
        Arc::new(markets.finish()),
        Arc::new(pairs.finish()),
        Arc::new(bids.finish()),
        Arc::new(asks.finish()),
        Arc::new(seqs.finish()),
    ];
    RecordBatch::try_new(snapshot_schema(), columns).context("failed to build snapshot batch")
}

fn levels_json(levels: &[PriceLevel]) -> Result<String> {
    let entries: Vec<[String; 2]> = levels
        .iter()
        .map(|level| [level.price.to_string(), level.amount.to_string()])
        .collect();
    serde_json::to_string(&entries).context("failed to encode levels")
}

fn millis_to_nanos(millis: i64) -> i64 {
    millis.saturating_mul(1_000_000)
}

fn decimal_to_i128(value: Decimal) -> Result<i128> {
    let scale_limit = DECIMAL_SCALE as i32;
    let mut normalized = value;
    if normalized.scale() as i32 > scale_limit {
        normalized = normalized
            .round_dp_with_strategy(DECIMAL_SCALE as u32, RoundingStrategy::MidpointNearestEven);
    }
    let diff = scale_limit - normalized.scale() as i32;
    let factor = 10i128
        .checked_pow(diff as u32)
        .ok_or_else(|| anyhow!("decimal scaling factor overflow"))?;
    normalized
        .mantissa()
        .checked_mul(factor)
        .ok_or_else(|| anyhow!("decimal mantissa overflow"))
}
