//! Step definitions and scenarios for the idempotency feature.

mod bdd_steps;
mod scenarios;
mod test_helpers;
