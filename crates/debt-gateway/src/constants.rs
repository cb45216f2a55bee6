use alloy::primitives::Address;

/// Canonical Permit2 contract, deployed at the same address on every chain.
/// 0x000000000022D473030F116dDEE9F6B43aC78BA3
pub const PERMIT2_ADDRESS: Address = Address::new([
    0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0xD4, 0x73, 0x03, 0x0F, 0x11, 0x6d, 0xDE, 0xE9, 0xF6, 0xB4,
    0x3a, 0xC7, 0x8B, 0xA3,
]);

/// EIP-712 domain name used by the Permit2 contract (it has no version field).
pub const PERMIT2_DOMAIN_NAME: &str = "Permit2";

/// Default decimal precision for quoted amounts (USDC-style 6 decimals).
pub const DEFAULT_AMOUNT_SCALE: u32 = 6;

/// Default per-payer payment threshold in monetary units.
pub const DEFAULT_PAYMENT_THRESHOLD: &str = "1.00";

/// Default platform commission rate applied to metered base cost.
pub const DEFAULT_COMMISSION_RATE: &str = "0.10";

/// Default SQLite database path for the debt ledger.
pub const DEFAULT_DB_PATH: &str = "./debt-ledger.db";
