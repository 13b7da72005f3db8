//! Connector registry and factory
//!
//! This module provides:
//! - The connector contract and session runtime shared by all venues
//! - Central registration of all supported exchanges
//! - A factory function to resolve connectors by id
//!
//! All exchange-specific logic must live in dedicated connector
//! modules. The rest of the application interacts exclusively through
//! the `ExchangeConnector` trait and the `Session` runtime.

pub mod connector;
pub mod rest;
pub mod session;

pub mod bingx;
pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod coinex;
pub mod gateio;
pub mod htx;
pub mod kucoin;
pub mod lbank;
pub mod mexc;
pub mod okx;

use std::sync::Arc;

use connector::ExchangeConnector;

use crate::schema::ExchangeId;

/// Returns the connector instance for a venue.
///
/// Central factory: keeps connector creation in one place and gives
/// compile-time visibility of the supported set — a new ExchangeId
/// variant fails to build until it is registered here.
///
/// THREADING:
/// - Connectors are wrapped in `Arc` and shared between the session
///   task and the supervisor's periodic REST tasks.
pub fn get_connector(id: ExchangeId) -> Arc<dyn ExchangeConnector> {
    match id {
        ExchangeId::Binance => Arc::new(binance::BinanceConnector::new()),
        ExchangeId::Bybit => Arc::new(bybit::BybitConnector::new()),
        ExchangeId::Okx => Arc::new(okx::OkxConnector::new()),
        ExchangeId::Kucoin => Arc::new(kucoin::KucoinConnector::new()),
        ExchangeId::Mexc => Arc::new(mexc::MexcConnector::new()),
        ExchangeId::Bitget => Arc::new(bitget::BitgetConnector::new()),
        ExchangeId::Gateio => Arc::new(gateio::GateioConnector::new()),
        ExchangeId::Bingx => Arc::new(bingx::BingxConnector::new()),
        ExchangeId::Coinex => Arc::new(coinex::CoinexConnector::new()),
        ExchangeId::Lbank => Arc::new(lbank::LbankConnector::new()),
        ExchangeId::Htx => Arc::new(htx::HtxConnector::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_exchange_resolves_to_its_connector() {
        for id in ExchangeId::ALL {
            let connector = get_connector(id);
            assert_eq!(connector.id(), id);
            assert!(connector.wire().ws_url.starts_with("wss://"));
            assert!(connector.wire().max_subs_per_frame >= 1);
        }
    }
}
