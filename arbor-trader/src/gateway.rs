//! Venue REST order gateway.
//!
//! The trait is the seam the coordinator and tests program against; the
//! REST implementation signs requests with HMAC-SHA256 and classifies
//! venue failures into retryable and terminal families.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use arbor_core::{Amount, ExecutionStatus, MarketKind, Pair, Price, Side, VenueId};

type HmacSha256 = Hmac<Sha256>;

/// Order placement request handed to a gateway.
#[derive(Clone, Debug)]
pub struct PlaceOrder {
    pub venue: VenueId,
    pub market: MarketKind,
    pub pair: Pair,
    pub account_id: i64,
    pub side: Side,
    pub qty: Amount,
    /// Limit price; `None` places a market order.
    pub price: Option<Price>,
    pub client_order_id: String,
}

impl PlaceOrder {
    pub fn market_order(
        venue: VenueId,
        market: MarketKind,
        pair: Pair,
        account_id: i64,
        side: Side,
        qty: Amount,
    ) -> Self {
        Self {
            venue,
            market,
            pair,
            account_id,
            side,
            qty,
            price: None,
            client_order_id: Uuid::new_v4().to_string(),
        }
    }
}

/// What the venue reported back for a placed order.
#[derive(Clone, Debug)]
pub struct Placement {
    pub venue_order_id: String,
    pub filled_qty: Amount,
    pub avg_price: Price,
    pub commission: Amount,
    pub commission_asset: String,
    pub status: ExecutionStatus,
}

/// Gateway failures. `is_retryable` drives the bounded-retry policy:
/// rate limits and venue outages retry, business rejections do not.
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("venue rate limited: {0}")]
    RateLimited(String),
    #[error("venue unavailable: {0}")]
    Unavailable(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("order rejected by venue: {0}")]
    Rejected(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited(_) | Self::Unavailable(_)
        )
    }

    /// The venue's own words, preserved for the transaction side log.
    #[must_use]
    pub fn venue_message(&self) -> &str {
        match self {
            Self::Transport(msg)
            | Self::RateLimited(msg)
            | Self::Unavailable(msg)
            | Self::Authentication(msg)
            | Self::Rejected(msg)
            | Self::InvalidRequest(msg) => msg,
        }
    }
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, request: &PlaceOrder) -> Result<Placement, GatewayError>;

    async fn cancel_order(
        &self,
        venue: VenueId,
        pair: &Pair,
        venue_order_id: &str,
    ) -> Result<(), GatewayError>;
}

/// Place with bounded retries on retryable failures; the last failure
/// surfaces as terminal.
pub async fn place_with_retry(
    gateway: &dyn OrderGateway,
    request: &PlaceOrder,
    max_attempts: u32,
    base_backoff: Duration,
) -> Result<Placement, GatewayError> {
    let mut backoff = base_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match gateway.place_order(request).await {
            Ok(placement) => return Ok(placement),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    venue = %request.venue,
                    pair = %request.pair,
                    attempt,
                    error = %err,
                    "order placement retrying"
                );
                sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Credentials for one venue account.
#[derive(Clone, Debug)]
pub struct GatewayCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// REST implementation signing requests the way the big venues expect:
/// millisecond timestamp + payload, HMAC-SHA256 over the secret, hex
/// signature header.
pub struct RestOrderGateway {
    http: reqwest::Client,
    base_url: String,
    credentials: GatewayCredentials,
}

#[derive(Deserialize)]
struct RestOrderResponse {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: Option<String>,
    #[serde(rename = "avgPrice", default)]
    avg_price: Option<String>,
    #[serde(rename = "commission", default)]
    commission: Option<String>,
    #[serde(rename = "commissionAsset", default)]
    commission_asset: Option<String>,
    #[serde(rename = "status", default)]
    status: Option<String>,
}

impl RestOrderGateway {
    pub fn new(base_url: String, credentials: GatewayCredentials) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn sign(&self, payload: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|err| GatewayError::Authentication(err.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn classify(response: reqwest::Response) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return GatewayError::RateLimited(body);
        }
        if status.is_server_error() {
            return GatewayError::Unavailable(body);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return GatewayError::Authentication(body);
        }
        // 4xx business errors: insufficient balance, bad symbol, size
        // below minimum. Never retried.
        GatewayError::Rejected(body)
    }
}

#[async_trait]
impl OrderGateway for RestOrderGateway {
    async fn place_order(&self, request: &PlaceOrder) -> Result<Placement, GatewayError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let body = json!({
            "symbol": request.pair.base().to_string() + request.pair.quote(),
            "side": request.side.catalog_code(),
            "type": if request.price.is_some() { "LIMIT" } else { "MARKET" },
            "quantity": request.qty.to_string(),
            "price": request.price.map(|price| price.to_string()),
            "newClientOrderId": request.client_order_id,
            "timestamp": timestamp,
        });
        let payload = body.to_string();
        let signature = self.sign(&payload)?;

        let response = self
            .http
            .post(format!("{}/order", self.base_url.trim_end_matches('/')))
            .header("X-API-KEY", &self.credentials.api_key)
            .header("X-SIGNATURE", signature)
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        let parsed: RestOrderResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::InvalidRequest(err.to_string()))?;

        let filled_qty = parse_decimal(parsed.executed_qty.as_deref()).unwrap_or(request.qty);
        let avg_price = parse_decimal(parsed.avg_price.as_deref())
            .or(request.price)
            .unwrap_or(Decimal::ZERO);
        Ok(Placement {
            venue_order_id: parsed.order_id,
            filled_qty,
            avg_price,
            commission: parse_decimal(parsed.commission.as_deref()).unwrap_or(Decimal::ZERO),
            commission_asset: parsed.commission_asset.unwrap_or_default(),
            status: parsed
                .status
                .as_deref()
                .and_then(|status| status.parse().ok())
                .unwrap_or(ExecutionStatus::Filled),
        })
    }

    async fn cancel_order(
        &self,
        _venue: VenueId,
        pair: &Pair,
        venue_order_id: &str,
    ) -> Result<(), GatewayError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let payload = format!("orderId={venue_order_id}&timestamp={timestamp}");
        let signature = self.sign(&payload)?;
        let response = self
            .http
            .delete(format!(
                "{}/order?symbol={}{}&orderId={}&timestamp={}",
                self.base_url.trim_end_matches('/'),
                pair.base(),
                pair.quote(),
                venue_order_id,
                timestamp,
            ))
            .header("X-API-KEY", &self.credentials.api_key)
            .header("X-SIGNATURE", signature)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Ok(())
    }
}

fn parse_decimal(text: Option<&str>) -> Option<Decimal> {
    text.and_then(|value| value.parse().ok())
}

/// Routes each order to the gateway configured for its venue.
#[derive(Default)]
pub struct RouterGateway {
    routes: std::collections::HashMap<VenueId, std::sync::Arc<dyn OrderGateway>>,
}

impl RouterGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, venue: VenueId, gateway: std::sync::Arc<dyn OrderGateway>) {
        self.routes.insert(venue, gateway);
    }

    #[must_use]
    pub fn has_route(&self, venue: VenueId) -> bool {
        self.routes.contains_key(&venue)
    }

    fn route(&self, venue: VenueId) -> Result<&std::sync::Arc<dyn OrderGateway>, GatewayError> {
        self.routes.get(&venue).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("no gateway configured for venue '{venue}'"))
        })
    }
}

#[async_trait]
impl OrderGateway for RouterGateway {
    async fn place_order(&self, request: &PlaceOrder) -> Result<Placement, GatewayError> {
        self.route(request.venue)?.place_order(request).await
    }

    async fn cancel_order(
        &self,
        venue: VenueId,
        pair: &Pair,
        venue_order_id: &str,
    ) -> Result<(), GatewayError> {
        self.route(venue)?
            .cancel_order(venue, pair, venue_order_id)
            .await
    }
}
