use crate::config::RegistryConfig;
use std::fmt;

/// Registry host the public Tiller image is pulled from.
pub static PUBLIC_TILLER_REGISTRY: &str = "gcr.io/kubernetes-helm";
static TILLER_REPOSITORY: &str = "tiller";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl ImageReference {
    pub fn tiller(registry: &str, tag: &str) -> Self {
        Self {
            registry: registry.to_string(),
            repository: TILLER_REPOSITORY.to_string(),
            tag: tag.to_string(),
        }
    }

    /// The Tiller image for `tag`, hosted on the private registry when one is
    /// configured and on the public registry otherwise.
    pub fn resolve_tiller(tag: &str, registry_config: &RegistryConfig) -> Self {
        if registry_config.has_registry_config() {
            Self::tiller(&registry_config.server, tag)
        } else {
            Self::tiller(PUBLIC_TILLER_REGISTRY, tag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_tiller_image() {
        let image = ImageReference::resolve_tiller("v2.16.12", &RegistryConfig::default());
        assert_eq!(image.to_string(), "gcr.io/kubernetes-helm/tiller:v2.16.12");
    }

    #[test]
    fn test_private_registry_tiller_image() {
        let registry_config = RegistryConfig {
            server: "registry.example.com:5000".to_string(),
            ..RegistryConfig::default()
        };
        let image = ImageReference::resolve_tiller("v2.16.12", &registry_config);
        assert_eq!(image.to_string(), "registry.example.com:5000/tiller:v2.16.12");
    }
}
