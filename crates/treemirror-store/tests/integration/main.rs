//! Integration tests for treemirror-store
//!
//! Uses wiremock to simulate the store API and verifies listing,
//! pagination, uploads, deletes, retries and error classification of the
//! StoreClient.

mod common;

mod test_listing;
mod test_mutations;
