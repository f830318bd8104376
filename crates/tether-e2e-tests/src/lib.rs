//! Test-only crate. See `tests/` for the integration suites.
