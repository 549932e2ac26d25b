pub mod dlq;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod orchestration_consumer;
pub mod outbox_publisher;
pub mod schedulers;
pub mod targeting;
pub mod user_directory;
