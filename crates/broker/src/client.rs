//! REST broker client (Alpaca-style `v2` trading API) with rate limiting.
//!
//! # Example
//!
//! ```ignore
//! use autotrade_broker::{Broker, BrokerClient, BrokerClientConfig};
//!
//! let client = BrokerClient::new(BrokerClientConfig::new("key-id", "secret"))?;
//! for position in client.list_positions().await? {
//!     println!("{} {}", position.symbol, position.qty);
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::{BrokerError, Result};
use crate::traits::Broker;
use crate::types::{Fill, Order, OrderRequest, Position};

/// Paper-trading endpoint.
pub const PAPER_URL: &str = "https://paper-api.alpaca.markets";

/// Live-trading endpoint.
pub const LIVE_URL: &str = "https://api.alpaca.markets";

const ACTIVITY_PAGE_SIZE: usize = 100;
const MAX_ACTIVITY_PAGES: usize = 20;

/// Configuration for [`BrokerClient`].
#[derive(Debug)]
pub struct BrokerClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: SecretString,
    pub requests_per_minute: NonZeroU32,
    /// Transport timeout; callers may apply a tighter one per call.
    pub timeout_secs: u64,
}

impl BrokerClientConfig {
    /// Paper-endpoint configuration with the given credentials.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            base_url: PAPER_URL.to_string(),
            api_key: api_key.into(),
            api_secret: SecretString::from(api_secret.into()),
            requests_per_minute: nonzero!(180u32),
            timeout_secs: 10,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, requests_per_minute: NonZeroU32) -> Self {
        self.requests_per_minute = requests_per_minute;
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Raw position. Some endpoints report shorts as a positive quantity plus `side`.
#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: Decimal,
    #[serde(default)]
    side: Option<String>,
    avg_entry_price: Decimal,
    #[serde(default)]
    current_price: Option<Decimal>,
}

impl From<RawPosition> for Position {
    fn from(raw: RawPosition) -> Self {
        let is_short = raw
            .side
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("short"));
        let qty = if is_short && raw.qty > Decimal::ZERO {
            -raw.qty
        } else {
            raw.qty
        };

        Self {
            symbol: raw.symbol.to_uppercase(),
            qty,
            avg_entry_price: raw.avg_entry_price,
            current_price: raw.current_price,
            opened_at: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ActivityQuery {
    after: String,
    until: String,
    direction: &'static str,
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// HTTP client for the broker's trading API.
///
/// All requests are rate-limited and carry the key-id/secret headers.
pub struct BrokerClient {
    config: BrokerClientConfig,
    http: Client,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.config.base_url)
            .field("requests_per_minute", &self.config.requests_per_minute)
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Creates a client.
    ///
    /// # Errors
    /// `Configuration` when credentials are missing, `Network` if the HTTP
    /// client cannot be built.
    pub fn new(config: BrokerClientConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() || config.api_secret.expose_secret().trim().is_empty() {
            return Err(BrokerError::Configuration(
                "broker api_key and api_secret are required".to_string(),
            ));
        }

        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BrokerError::Network(format!("failed to build HTTP client: {e}")))?;

        let quota = Quota::per_minute(config.requests_per_minute);
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Ok(Self {
            config,
            http,
            rate_limiter,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Rejects identifiers that could alter the request path.
    fn validate_identifier(id: &str) -> Result<&str> {
        let id = id.trim();
        if id.is_empty() || id.len() > 128 {
            return Err(BrokerError::InvalidRequest(format!(
                "invalid identifier: {id:?}"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(BrokerError::InvalidRequest(format!(
                "identifier contains invalid characters: {id:?}"
            )));
        }
        Ok(id)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url, path);
        tracing::debug!("{} {}", method, url);
        self.http
            .request(method, &url)
            .header("Accept", "application/json")
            .header("APCA-API-KEY-ID", &self.config.api_key)
            .header(
                "APCA-API-SECRET-KEY",
                self.config.api_secret.expose_secret(),
            )
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.rate_limiter.until_ready().await;
        let response = self.request(reqwest::Method::GET, path).send().await?;
        Self::handle_response(path, response).await
    }

    async fn get_with_query<T: DeserializeOwned, Q: Serialize>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;
        let response = self
            .request(reqwest::Method::GET, path)
            .query(query)
            .send()
            .await?;
        Self::handle_response(path, response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.rate_limiter.until_ready().await;
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNPROCESSABLE_ENTITY {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected(text));
        }
        Self::handle_response(path, response).await
    }

    async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        self.rate_limiter.until_ready().await;
        let response = self.request(reqwest::Method::DELETE, path).send().await?;
        Self::check_status(path, response).await
    }

    async fn check_status(path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(BrokerError::not_found(path));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(BrokerError::RateLimit {
                retry_after_secs: retry_after,
            });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::api(status.as_u16(), text));
        }

        Ok(response)
    }

    async fn handle_response<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let response = Self::check_status(path, response).await?;
        let body = response.json::<T>().await?;
        Ok(body)
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl Broker for BrokerClient {
    async fn list_positions(&self) -> Result<Vec<Position>> {
        let raw: Vec<RawPosition> = self.get("/v2/positions").await?;
        Ok(raw.into_iter().map(Position::from).collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let symbol = Self::validate_identifier(symbol)?.to_uppercase();
        match self
            .get::<RawPosition>(&format!("/v2/positions/{symbol}"))
            .await
        {
            Ok(raw) => Ok(Some(raw.into())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_open_orders(&self) -> Result<Vec<Order>> {
        self.get_with_query(
            "/v2/orders",
            &[("status", "open"), ("nested", "true"), ("limit", "500")],
        )
        .await
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        let order_id = Self::validate_identifier(order_id)?;
        self.get_with_query(&format!("/v2/orders/{order_id}"), &[("nested", "true")])
            .await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order> {
        if request.qty <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(format!(
                "order quantity must be positive, got {}",
                request.qty
            )));
        }
        let order: Order = self.post("/v2/orders", request).await?;
        tracing::info!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = order.side.as_str(),
            status = order.status.as_str(),
            "order submitted"
        );
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let order_id = Self::validate_identifier(order_id)?;
        self.delete(&format!("/v2/orders/{order_id}")).await?;
        Ok(())
    }

    async fn close_position(&self, symbol: &str) -> Result<Order> {
        let symbol = Self::validate_identifier(symbol)?.to_uppercase();
        let path = format!("/v2/positions/{symbol}");
        let response = self.delete(&path).await?;
        let order = response.json::<Order>().await?;
        Ok(order)
    }

    async fn list_fills(
        &self,
        symbol: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Fill>> {
        let symbol = Self::validate_identifier(symbol)?.to_uppercase();
        let mut fills = Vec::new();
        let mut page_token = None;
        let mut exhausted = false;

        for _ in 0..MAX_ACTIVITY_PAGES {
            let query = ActivityQuery {
                after: rfc3339(after),
                until: rfc3339(until),
                direction: "asc",
                page_size: ACTIVITY_PAGE_SIZE,
                page_token: page_token.take(),
            };
            let page: Vec<Fill> = self
                .get_with_query("/v2/account/activities/FILL", &query)
                .await?;
            let page_len = page.len();
            page_token = page.last().and_then(|f| f.id.clone());

            fills.extend(
                page.into_iter()
                    .filter(|f| f.symbol.eq_ignore_ascii_case(&symbol)),
            );

            if page_len < ACTIVITY_PAGE_SIZE || page_token.is_none() {
                exhausted = true;
                break;
            }
        }

        if !exhausted {
            return Err(BrokerError::Incomplete(format!(
                "fill activity for {symbol} exceeds {MAX_ACTIVITY_PAGES} pages"
            )));
        }

        fills.retain(|f| f.transaction_time >= after && f.transaction_time <= until);
        fills.sort_by_key(|f| f.transaction_time);
        Ok(fills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, OrderStatus, TimeInForce};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BrokerClient {
        BrokerClient::new(BrokerClientConfig::new("key-id", "shh").with_base_url(server.uri()))
            .unwrap()
    }

    fn order_json(id: &str, status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "symbol": "AAPL",
            "side": "sell",
            "type": "stop",
            "status": status,
            "qty": "10",
            "stop_price": "98.5",
            "time_in_force": "day"
        })
    }

    #[test]
    fn config_requires_credentials() {
        let err = BrokerClient::new(BrokerClientConfig::new("", "")).unwrap_err();
        assert!(matches!(err, BrokerError::Configuration(_)));
    }

    #[test]
    fn debug_output_hides_secret() {
        let config = BrokerClientConfig::new("key-id", "super-secret");
        assert!(!format!("{config:?}").contains("super-secret"));
    }

    #[test]
    fn validate_identifier_rejects_path_traversal() {
        assert!(BrokerClient::validate_identifier("../v2/account").is_err());
        assert!(BrokerClient::validate_identifier("a/b").is_err());
        assert!(BrokerClient::validate_identifier("").is_err());
        assert_eq!(
            BrokerClient::validate_identifier(" 61e69015-8549-4bfd ").unwrap(),
            "61e69015-8549-4bfd"
        );
    }

    #[tokio::test]
    async fn list_positions_signs_short_quantity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/positions"))
            .and(header("APCA-API-KEY-ID", "key-id"))
            .and(header("APCA-API-SECRET-KEY", "shh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "AAPL", "qty": "10", "side": "long",
                 "avg_entry_price": "100.00", "current_price": "101.50"},
                {"symbol": "TSLA", "qty": "5", "side": "short",
                 "avg_entry_price": "250.00", "current_price": null}
            ])))
            .mount(&server)
            .await;

        let positions = client_for(&server).list_positions().await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].qty, dec!(10));
        assert_eq!(positions[0].current_price, Some(dec!(101.5)));
        assert_eq!(positions[1].qty, dec!(-5));
        assert!(positions[1].is_short());
    }

    #[tokio::test]
    async fn missing_position_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/positions/AAPL"))
            .respond_with(ResponseTemplate::new(404).set_body_string("position does not exist"))
            .mount(&server)
            .await;

        let position = client_for(&server).get_position("aapl").await.unwrap();
        assert!(position.is_none());
    }

    #[tokio::test]
    async fn cancel_missing_order_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/orders/gone-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/orders/live-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.cancel_order("gone-1").await.unwrap_err().is_not_found());
        client.cancel_order("live-1").await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orders"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = client_for(&server).list_open_orders().await.unwrap_err();
        assert!(matches!(err, BrokerError::RateLimit { retry_after_secs: 7 }));
    }

    #[tokio::test]
    async fn get_order_requests_nested_legs() {
        let server = MockServer::start().await;
        let mut parent = order_json("parent-1", "filled");
        parent["type"] = "market".into();
        parent["side"] = "buy".into();
        parent["legs"] = serde_json::json!([order_json("leg-1", "held")]);
        Mock::given(method("GET"))
            .and(path("/v2/orders/parent-1"))
            .and(query_param("nested", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(parent))
            .mount(&server)
            .await;

        let order = client_for(&server).get_order("parent-1").await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        let legs: Vec<_> = order.stop_legs().collect();
        assert_eq!(legs.len(), 1);
        assert!(legs[0].status.is_active_stop());
    }

    #[tokio::test]
    async fn submit_stop_order_posts_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .and(body_partial_json(serde_json::json!({
                "symbol": "AAPL", "side": "sell", "type": "stop",
                "time_in_force": "day", "stop_price": "98.5"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_json("stop-9", "accepted")))
            .mount(&server)
            .await;

        let request =
            OrderRequest::stop("AAPL", dec!(10), OrderSide::Sell, dec!(98.5), TimeInForce::Day);
        let order = client_for(&server).submit_order(&request).await.unwrap();
        assert_eq!(order.id, "stop-9");
        assert_eq!(order.status, OrderStatus::Accepted);
    }

    #[tokio::test]
    async fn submit_rejected_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .respond_with(ResponseTemplate::new(403).set_body_string("insufficient qty"))
            .mount(&server)
            .await;

        let request = OrderRequest::market("AAPL", dec!(10), OrderSide::Sell);
        let err = client_for(&server).submit_order(&request).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(msg) if msg.contains("insufficient")));
    }

    #[tokio::test]
    async fn list_fills_filters_symbol_and_window() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/account/activities/FILL"))
            .and(query_param("direction", "asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "a1", "order_id": "o1", "symbol": "AAPL", "side": "buy",
                 "qty": "10", "price": "100", "transaction_time": "2026-03-02T15:00:00Z"},
                {"id": "a2", "order_id": "o2", "symbol": "MSFT", "side": "buy",
                 "qty": "1", "price": "300", "transaction_time": "2026-03-02T15:01:00Z"},
                {"id": "a3", "order_id": "o3", "symbol": "AAPL", "side": "sell",
                 "qty": "10", "price": "102", "transaction_time": "2026-03-02T16:00:00Z"}
            ])))
            .mount(&server)
            .await;

        let after = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap();
        let fills = client_for(&server)
            .list_fills("AAPL", after, until)
            .await
            .unwrap();
        let ids: Vec<_> = fills.iter().map(|f| f.order_id.as_str()).collect();
        assert_eq!(ids, vec!["o1", "o3"]);
    }

    #[tokio::test]
    async fn list_fills_errors_when_pages_run_out() {
        let server = MockServer::start().await;
        let page: Vec<serde_json::Value> = (0..ACTIVITY_PAGE_SIZE)
            .map(|i| {
                serde_json::json!({
                    "id": format!("a{i}"), "order_id": format!("o{i}"), "symbol": "AAPL",
                    "side": "buy", "qty": "1", "price": "100",
                    "transaction_time": "2026-03-02T15:00:00Z"
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/v2/account/activities/FILL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page))
            .mount(&server)
            .await;

        let after = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap();
        let err = client_for(&server)
            .list_fills("AAPL", after, until)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Incomplete(_)));
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), MAX_ACTIVITY_PAGES);
    }
}
