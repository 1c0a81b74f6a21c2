pub mod idempotency_record;
