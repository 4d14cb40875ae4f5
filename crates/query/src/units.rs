use std::str::FromStr;

use alloy_primitives::U256;
use matrixsync_core::AppError;

/// Wei per hundredth of a token (18 decimals, shown with 2).
const WEI_PER_CENT: u64 = 10_000_000_000_000_000;

/// Format a wei amount as a token amount with two decimals, rounding half
/// up. Exact: no floating point is involved.
pub fn wei_to_display(wei: &str) -> Result<String, AppError> {
    let wei = U256::from_str(wei.trim())
        .map_err(|e| AppError::Decode(format!("invalid amount {wei:?}: {e}")))?;
    let step = U256::from(WEI_PER_CENT);
    let (mut cents, rem) = wei.div_rem(step);
    if rem.saturating_mul(U256::from(2u8)) >= step {
        cents = cents.saturating_add(U256::from(1u8));
    }
    let (whole, frac) = cents.div_rem(U256::from(100u8));
    Ok(format!("{whole}.{:02}", frac.to::<u64>()))
}
