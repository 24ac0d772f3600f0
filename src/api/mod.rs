// =============================================================================
// HTTP API Module
// =============================================================================
//
// Read-only JSON surface over store snapshots for the dashboard frontend.
// The worker is the sole writer; nothing in here mutates engine state.

pub mod rest;
