//! Broker integration for automated position management.
//!
//! This crate provides:
//! - The [`Broker`] trait: positions, open orders, order get/submit/cancel,
//!   position close and the fill activity feed
//! - [`BrokerClient`], a rate-limited REST client for the `v2` trading API
//! - [`PaperBroker`], an in-memory broker for dry runs and tests
//!
//! # Authentication
//!
//! The REST client sends `APCA-API-KEY-ID` / `APCA-API-SECRET-KEY` headers.
//! The secret is held as a [`secrecy::SecretString`] and never printed.
//!
//! # API Endpoints
//!
//! - `GET /v2/positions`, `GET /v2/positions/{symbol}`, `DELETE /v2/positions/{symbol}`
//! - `GET /v2/orders?status=open&nested=true`, `GET /v2/orders/{id}?nested=true`
//! - `POST /v2/orders`, `DELETE /v2/orders/{id}`
//! - `GET /v2/account/activities/FILL`

pub mod client;
pub mod error;
pub mod paper;
pub mod traits;
pub mod types;

pub use client::{BrokerClient, BrokerClientConfig, LIVE_URL, PAPER_URL};
pub use error::{BrokerError, Result};
pub use paper::{bracket_parent, resting_stop, PaperBroker, PaperCall, PaperFailure, PaperOp};
pub use traits::Broker;
pub use types::{Fill, Order, OrderRequest, OrderSide, OrderStatus, OrderType, Position, TimeInForce};
