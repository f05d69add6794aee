//! Process configuration, read from the environment (with CLI overrides).
//!
//! Mirrors the teacher's choice of `clap`'s derive API for argument
//! parsing; unlike `main.rs`'s original hand-rolled arg handling, every
//! field here also binds an environment variable so the server is
//! configurable purely from the process environment in production.
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "callisto", about = "Multi-tenant real-time tabletop session server")]
pub struct Config {
  /// Address to bind the HTTP/WebSocket listener to.
  #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
  pub bind_addr: String,

  /// SQLite connection string, e.g. `sqlite://callisto.db`.
  #[arg(long, env = "DATABASE_URL")]
  pub database_url: String,

  /// Secret used to sign and verify bearer credentials.
  #[arg(long, env = "SECRET_KEY")]
  pub secret_key: String,

  /// Secondary secret for session-cookie signing; defaults to `secret_key` if unset.
  #[arg(long, env = "SESSION_SECRET")]
  pub session_secret: Option<String>,

  /// Public base URL of this deployment, used in invitation links.
  #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080")]
  pub base_url: String,

  #[arg(long, env = "ENVIRONMENT", default_value = "development")]
  pub environment: String,

  /// Seconds a session may sit with no connected clients before eviction.
  #[arg(long, env = "SESSION_IDLE_TIMEOUT", default_value_t = 300)]
  pub session_idle_timeout_secs: u64,

  /// Bound on each client's outbound message queue.
  #[arg(long, env = "CLIENT_QUEUE_DEPTH", default_value_t = 256)]
  pub client_queue_depth: usize,

  /// Mutation count that triggers a persistence flush.
  #[arg(long, env = "MUTATION_BATCH_SIZE", default_value_t = 50)]
  pub mutation_batch_size: usize,

  /// Milliseconds that trigger a persistence flush even if the batch isn't full.
  #[arg(long, env = "MUTATION_BATCH_INTERVAL_MS", default_value_t = 500)]
  pub mutation_batch_interval_ms: u64,

  /// Maximum new-user registrations per rolling window, globally and per-IP.
  #[arg(long, env = "REGISTRATION_FLOOD_LIMIT", default_value_t = 10)]
  pub registration_flood_limit: i64,

  #[arg(long, env = "REGISTRATION_FLOOD_WINDOW_SECS", default_value_t = 600)]
  pub registration_flood_window_secs: i64,

  #[arg(long, env = "JWT_EXPIRY_SECS", default_value_t = 60 * 60 * 24 * 7)]
  pub jwt_expiry_secs: i64,

  /// Directory holding the compendium's per-category JSON files.
  #[arg(long, env = "COMPENDIUM_DIR", default_value = "compendium")]
  pub compendium_dir: String,
}

impl Config {
  #[must_use]
  pub fn session_secret(&self) -> &str {
    self.session_secret.as_deref().unwrap_or(&self.secret_key)
  }

  #[must_use]
  pub fn is_production(&self) -> bool {
    self.environment == "production"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn session_secret_falls_back_to_secret_key() {
    let cfg = Config {
      bind_addr: "0.0.0.0:8080".into(),
      database_url: "sqlite::memory:".into(),
      secret_key: "shh".into(),
      session_secret: None,
      base_url: "http://localhost".into(),
      environment: "development".into(),
      session_idle_timeout_secs: 300,
      client_queue_depth: 256,
      mutation_batch_size: 50,
      mutation_batch_interval_ms: 500,
      registration_flood_limit: 10,
      registration_flood_window_secs: 600,
      jwt_expiry_secs: 604_800,
      compendium_dir: "compendium".into(),
    };
    assert_eq!(cfg.session_secret(), "shh");
  }
}
