//! Empty by design — cross-crate coverage lives under `tests/`.
