use semver::Version;
use tracing::debug;

/// The tag of an image reference: everything after the final `:`.
/// Returns `None` when the reference carries no `:` at all.
pub fn version_tag(image: &str) -> Option<&str> {
    image.rsplit_once(':').map(|(_, tag)| tag)
}

fn parse_tag(tag: &str) -> Option<Version> {
    Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

/// Whether `new_image` carries a strictly greater version than `existing_image`.
///
/// An image whose version cannot be determined, either because it has no tag or
/// because the tag is not a semantic version, counts as newer. Upgrades on
/// unrecognised tags are intentional.
pub fn is_newer_version(existing_image: &str, new_image: &str) -> bool {
    let (Some(existing_tag), Some(new_tag)) = (version_tag(existing_image), version_tag(new_image))
    else {
        return true;
    };

    match (parse_tag(existing_tag), parse_tag(new_tag)) {
        (Some(existing), Some(new)) => new > existing,
        _ => {
            debug!(
                "Could not compare versions {} and {}, treating {} as newer",
                existing_tag, new_tag, new_image
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tag() {
        assert_eq!(version_tag("gcr.io/kubernetes-helm/tiller:v2.9.1"), Some("v2.9.1"));
        assert_eq!(version_tag("registry:5000/tiller:2.0.0"), Some("2.0.0"));
        assert_eq!(version_tag("gcr.io/kubernetes-helm/tiller"), None);
    }

    #[test]
    fn test_missing_tag_is_newer() {
        assert!(is_newer_version("gcr.io/kubernetes-helm/tiller", "tiller:1.0.0"));
        assert!(is_newer_version("tiller:9.0.0", "gcr.io/kubernetes-helm/tiller"));
    }

    #[test]
    fn test_unparseable_tag_is_newer() {
        assert!(is_newer_version("tiller:latest", "tiller:1.0.0"));
        assert!(is_newer_version("tiller:2.0.0", "tiller:canary"));
    }

    #[test]
    fn test_semantic_ordering() {
        assert!(is_newer_version("tiller:1.0.0", "tiller:1.1.0"));
        assert!(is_newer_version("tiller:v2.9.1", "tiller:v2.16.12"));
        assert!(!is_newer_version("tiller:2.0.0", "tiller:1.9.0"));
        assert!(!is_newer_version("tiller:v2.16.12", "tiller:2.16.12"));
    }

    #[test]
    fn test_registry_port_does_not_count_as_tag() {
        assert!(!is_newer_version(
            "registry.example.com:5000/tiller:2.0.0",
            "registry.example.com:5000/tiller:1.9.0"
        ));
    }
}
