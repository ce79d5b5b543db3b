//! Upstream provider adapters
//!
//! Three adapters share one output contract: a sequence of canonical
//! [`crate::models::Event`]s, written to the provider's own cache file by a
//! refresh run. The feed builder never talks to an adapter directly, only
//! to the caches.

pub mod oebb;
pub mod region;
pub mod vor;
pub mod wiener_linien;

use crate::config::Config;

/// The three upstream sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Municipal realtime endpoint (Wiener Linien)
    WienerLinien,
    /// National-railway RSS endpoint (ÖBB)
    Oebb,
    /// Regional-authority REST endpoint (VOR/VAO)
    Vor,
}

impl ProviderKind {
    pub fn all() -> [ProviderKind; 3] {
        [Self::WienerLinien, Self::Oebb, Self::Vor]
    }

    /// Directory name under `data/` owning the cache file.
    pub fn cache_name(&self) -> &'static str {
        match self {
            Self::WienerLinien => "wl",
            Self::Oebb => "oebb",
            Self::Vor => "vor",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::WienerLinien => "Wiener Linien",
            Self::Oebb => "ÖBB",
            Self::Vor => "VOR/VAO",
        }
    }

    /// Parse a CLI argument into a provider.
    pub fn from_arg(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "wl" | "wiener-linien" | "wienerlinien" => Some(Self::WienerLinien),
            "oebb" | "öbb" => Some(Self::Oebb),
            "vor" | "vao" => Some(Self::Vor),
            _ => None,
        }
    }

    pub fn is_enabled(&self, config: &Config) -> bool {
        match self {
            Self::WienerLinien => config.wl.enabled,
            Self::Oebb => config.oebb.enabled,
            Self::Vor => config.vor.enabled,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.cache_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_arg_aliases() {
        assert_eq!(ProviderKind::from_arg("wl"), Some(ProviderKind::WienerLinien));
        assert_eq!(
            ProviderKind::from_arg("Wiener-Linien"),
            Some(ProviderKind::WienerLinien)
        );
        assert_eq!(ProviderKind::from_arg("oebb"), Some(ProviderKind::Oebb));
        assert_eq!(ProviderKind::from_arg("VAO"), Some(ProviderKind::Vor));
        assert_eq!(ProviderKind::from_arg("sbahn"), None);
    }

    #[test]
    fn test_cache_names_unique() {
        let names: std::collections::HashSet<_> =
            ProviderKind::all().iter().map(|p| p.cache_name()).collect();
        assert_eq!(names.len(), 3);
    }
}
