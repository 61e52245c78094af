// src/config/mod.rs
pub mod profiles;
pub mod settings;

pub use profiles::{ProfileName, RateLimiterProfile};
pub use settings::Config;

use crate::error::HunterError;
use std::sync::Arc;

/// Loads `.env` (if present) and the environment into a validated `Config`.
/// Nothing is logged here since the logger is configured from the result;
/// problems with individual variables end up in `Config::load_warnings`.
/// `profile` and `test_mode` come from the command line and win over the
/// environment.
pub fn load_config(
    profile: Option<ProfileName>,
    test_mode: bool,
) -> Result<Arc<Config>, HunterError> {
    dotenv::dotenv().ok();

    let mut config = Config::from_env();
    if test_mode {
        config.rate_limiter = config.rate_limiter.clone().with_test_mode(true);
    }
    if let Some(name) = profile {
        config.apply_profile(&name.profile());
    }

    config.validate()?;
    Ok(Arc::new(config))
}
