use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use matrixsync_core::AppError;

/// The RPC provider type used throughout the application.
///
/// Type-erased so HTTP and WebSocket transports share one type.
pub type ChainProvider = DynProvider;

/// Create an HTTP provider from an RPC URL string.
pub fn create_provider(rpc_url: &str) -> eyre::Result<ChainProvider> {
    let url = rpc_url.parse()?;
    let provider = ProviderBuilder::new().connect_http(url);
    Ok(provider.erased())
}

/// Create a WebSocket provider, used for `eth_subscribe` log streams.
pub async fn create_ws_provider(ws_url: &str) -> eyre::Result<ChainProvider> {
    let provider = ProviderBuilder::new()
        .connect_ws(WsConnect::new(ws_url))
        .await?;
    Ok(provider.erased())
}

/// Parse a configured contract address.
pub fn parse_address(raw: &str) -> Result<Address, AppError> {
    raw.trim()
        .parse()
        .map_err(|e| AppError::Config(format!("invalid address {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_with_or_without_checksum() {
        let lower = parse_address("0x2000000000000000000000000000000000000002").unwrap();
        let padded = parse_address(" 0x2000000000000000000000000000000000000002 ").unwrap();
        assert_eq!(lower, padded);
        assert!(matches!(parse_address("0x123"), Err(AppError::Config(_))));
    }
}
