//! Feed-build mode: read the provider caches and emit the RSS feed.

use crate::config::Config;
use crate::error::Result;
use crate::feed::{self, BuildOutcome};

/// Run one feed build.
pub async fn execute(config: &Config) -> Result<BuildOutcome> {
    feed::build(config).await
}
