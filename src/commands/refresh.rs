//! Cache-refresh mode: fetch one provider's upstream, normalise, and
//! replace its cache file atomically. No feed is produced here.

use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::fetch::{RequestPolicy, SecureClient};
use crate::providers::{oebb, vor, wiener_linien, ProviderKind};
use crate::stations::StationCatalogue;
use crate::storage::{CacheStore, DailyQuota};

const USER_AGENT: &str = concat!("wienfeed/", env!("CARGO_PKG_VERSION"));

fn load_catalogue(config: &Config) -> StationCatalogue {
    match StationCatalogue::load(&config.stations_path) {
        Ok(catalogue) => catalogue,
        Err(e) => {
            warn!(error = %e, "station catalogue unavailable, filtering degrades to keywords");
            StationCatalogue::empty()
        }
    }
}

/// Run one refresh for `provider`.
pub async fn execute(config: &Config, provider: ProviderKind) -> Result<()> {
    if !provider.is_enabled(config) {
        info!(provider = %provider, "provider disabled, nothing to refresh");
        return Ok(());
    }

    let events = match provider {
        ProviderKind::WienerLinien => {
            let policy = RequestPolicy::default().with_timeout(Some(config.wl.http_timeout));
            let client = SecureClient::new(USER_AGENT, policy)?;
            wiener_linien::fetch_events(&config.wl, &client).await?
        }
        ProviderKind::Oebb => {
            let policy = RequestPolicy::default().with_timeout(Some(config.oebb.http_timeout));
            let client = SecureClient::new(USER_AGENT, policy)?;
            let catalogue = load_catalogue(config);
            oebb::fetch_events(&config.oebb, &client, &catalogue).await?
        }
        ProviderKind::Vor => {
            let mut policy =
                RequestPolicy::default().with_timeout(Some(config.vor.http_timeout));
            if config.vor.auth_in_header {
                policy.sensitive_headers.push("accessId".into());
            }
            let client = SecureClient::new(USER_AGENT, policy)?;
            let catalogue = load_catalogue(config);
            let counter_path = crate::config::validate_path(
                &config.base_dir,
                std::path::Path::new("data/vor/requests.json"),
                "VOR counter path",
            )?;
            let quota = DailyQuota::new(counter_path);
            vor::fetch_events(&config.vor, &client, &catalogue, &quota).await?
        }
    };

    let store = CacheStore::new(config.base_dir.clone(), config.cache_pretty);
    store.write(provider.cache_name(), &events)?;
    info!(
        provider = %provider,
        items = events.len(),
        "cache refreshed"
    );
    Ok(())
}
