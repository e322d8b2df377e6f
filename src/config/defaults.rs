//! System-wide default constants.
//!
//! Centralises the timing and retry numbers the cart has always shipped with.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Command Link
// ============================================================================

/// Attempts per command before the triggering action is abandoned.
pub const LINK_ATTEMPTS: u32 = 3;

/// How long a single attempt waits for `ACK` (milliseconds).
pub const LINK_ACK_WINDOW_MS: u64 = 1_000;

/// Pause between two attempts of the same command (milliseconds).
pub const LINK_BACKOFF_MS: u64 = 200;

/// Baud rate of the motor controller UART.
pub const LINK_BAUD_RATE: u32 = 9_600;

/// Read timeout on blocking transports so the reader thread can notice shutdown.
pub const LINK_READ_POLL_MS: u64 = 100;

// ============================================================================
// Bridge Reconnection
// ============================================================================

/// Reconnect attempts after the link bridge drops.
pub const LINK_RECONNECT_ATTEMPTS: u32 = 5;

/// First reconnect delay for the link bridge (milliseconds, doubles each attempt).
pub const LINK_RECONNECT_DELAY_MS: u64 = 500;

/// Reconnect attempts after the reader bridge drops.
pub const READER_RECONNECT_ATTEMPTS: u32 = 10;

/// First reconnect delay for the reader bridge (milliseconds, doubles each attempt).
pub const READER_RECONNECT_DELAY_MS: u64 = 2_000;

/// Cap on any single reconnect delay (milliseconds).
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

// ============================================================================
// Payment Ledger
// ============================================================================

/// Fetch attempts when an administrator card triggers a refresh.
pub const LEDGER_REFRESH_RETRIES: u32 = 3;

/// Fetch attempts when `/start` finds no active order.
pub const LEDGER_START_REFRESH_RETRIES: u32 = 5;

/// Delay after each failed fetch/parse attempt (milliseconds).
pub const LEDGER_REFRESH_DELAY_MS: u64 = 3_000;

// ============================================================================
// Backend + Stand
// ============================================================================

/// Whole-request timeout for backend calls (milliseconds).
pub const BACKEND_TIMEOUT_MS: u64 = 3_000;

/// Stand notification attempts after a confirmed working-list addition.
pub const STAND_ATTEMPTS: u32 = 3;

/// Delay between stand notification attempts (milliseconds).
pub const STAND_RETRY_DELAY_MS: u64 = 1_000;

// ============================================================================
// Control Surface
// ============================================================================

/// Delay between replying to a config change and restarting (milliseconds).
pub const RESTART_DELAY_MS: u64 = 3_000;

/// Consecutive failed runtime generations before the process gives up.
pub const MAX_GENERATION_FAILURES: u32 = 5;

/// Upper bound on accepted request bodies (bytes).
pub const MAX_BODY_BYTES: usize = 16 * 1024;
