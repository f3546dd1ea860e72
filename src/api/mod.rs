// =============================================================================
// API — REST endpoints and the WebSocket subscriber gateway
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;
