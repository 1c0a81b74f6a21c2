use std::sync::Arc;

use idempotency::IdempotencyService;

/// Shared application state, constructed once in `main` and cloned into
/// handlers and middleware. Holds the one [`IdempotencyService`] instance so
/// the backing store can be swapped without touching the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub idempotency: Arc<IdempotencyService>,
}

impl AppState {
    pub fn new(idempotency: Arc<IdempotencyService>) -> Self {
        Self { idempotency }
    }
}
