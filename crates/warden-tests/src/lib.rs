//! Integration tests for the warden service registry live in `tests/`.
