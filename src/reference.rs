//! Image reference parsing and normalization.
//!
//! Mirrors the shape of the reference parser used by the closest sibling
//! in the example pack (dockge's `update_checker::parse_image_reference`),
//! generalized to also recognize digest pins and compose-style
//! `${VAR:-default}` substitution.

use std::collections::HashSet;
use std::fmt;

pub const DOCKER_HUB_REGISTRY: &str = "docker.io";
const DOCKER_HUB_REGISTRY_ALT: &str = "index.docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid image reference `{}`", self.0)
    }
}

impl std::error::Error for ParseError {}

impl Reference {
    pub fn is_digest_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// The top-level path segment, used by the prune phase to group tags
    /// by repository the way spec.md's Prune phase requires.
    pub fn repository_root(&self) -> &str {
        self.repository.split('/').next().unwrap_or(&self.repository)
    }

    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Fully-qualified `registry/repository[:tag|@digest]`, using the
    /// literal registry (absent => no prefix) the reference was parsed with.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(r) = &self.registry {
            out.push_str(r);
            out.push('/');
        }
        out.push_str(&self.repository);
        if let Some(d) = &self.digest {
            out.push('@');
            out.push_str(d);
        } else {
            out.push(':');
            out.push_str(self.tag_or_default());
        }
        out
    }

    /// All fully-qualified names the engine may reasonably use for this
    /// same logical image: the literal, the explicit `docker.io/...` and
    /// `index.docker.io/...` forms, and (for single-segment Docker Hub
    /// repos) the `library/...` expansion, crossed with each alias.
    pub fn canonical_aliases(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        out.insert(self.render());

        let is_hub = self.registry.is_none()
            || self.registry.as_deref() == Some(DOCKER_HUB_REGISTRY)
            || self.registry.as_deref() == Some(DOCKER_HUB_REGISTRY_ALT);

        if is_hub {
            let repos: Vec<String> = if self.repository.contains('/') {
                vec![self.repository.clone()]
            } else {
                vec![self.repository.clone(), format!("library/{}", self.repository)]
            };
            let registries = [None, Some(DOCKER_HUB_REGISTRY), Some(DOCKER_HUB_REGISTRY_ALT)];
            for reg in registries {
                for repo in &repos {
                    let suffix = match &self.digest {
                        Some(d) => format!("@{d}"),
                        None => format!(":{}", self.tag_or_default()),
                    };
                    out.insert(match reg {
                        Some(r) => format!("{r}/{repo}{suffix}"),
                        None => format!("{repo}{suffix}"),
                    });
                }
            }
        }
        out
    }
}

/// Parses `[registry[:port]/]repo[/sub...]/name[:tag|@digest]`.
///
/// Tolerates compose-style `${VAR:-default}` substitution by treating the
/// default as the literal tag, and expands single-segment Docker Hub
/// repository names to `library/<name>` so equality is alias-insensitive.
pub fn parse(input: &str) -> Result<Reference, ParseError> {
    if input.is_empty() || input.chars().any(char::is_whitespace) {
        return Err(ParseError(input.to_string()));
    }

    let substituted = substitute_env_default(input);
    let mut s = substituted.as_str();

    let digest = if let Some(pos) = s.find('@') {
        let d = s[pos + 1..].to_string();
        s = &s[..pos];
        Some(d)
    } else {
        None
    };

    let mut tag = None;
    let last_colon = s.rfind(':');
    let last_slash = s.rfind('/');
    if let Some(colon_pos) = last_colon {
        let slash_pos = last_slash.unwrap_or(0);
        // only treat the trailing `:token` as a tag, never as a registry port
        if colon_pos > slash_pos || last_slash.is_none() {
            if digest.is_none() {
                tag = Some(s[colon_pos + 1..].to_string());
            }
            s = &s[..colon_pos];
        }
    }

    let parts: Vec<&str> = s.split('/').collect();
    let (registry, repository) = if parts.len() >= 2 && (parts[0].contains('.') || parts[0].contains(':') || parts[0] == "localhost") {
        (Some(parts[0].to_string()), parts[1..].join("/"))
    } else if parts.len() == 1 {
        (None, format!("library/{}", parts[0]))
    } else {
        (None, parts.join("/"))
    };

    if repository.is_empty() {
        return Err(ParseError(input.to_string()));
    }

    let registry = registry.map(normalize_registry_alias);

    Ok(Reference { registry, repository, tag, digest })
}

fn normalize_registry_alias(registry: String) -> String {
    if registry == DOCKER_HUB_REGISTRY_ALT {
        DOCKER_HUB_REGISTRY.to_string()
    } else {
        registry
    }
}

/// Replaces `${VAR:-default}` occurrences with `default`, and bare
/// `${VAR}` with an empty string, as a compose-file env-substitution
/// preprocessor would before the reference ever reaches the engine.
fn substitute_env_default(input: &str) -> String {
    if !input.contains("${") {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let inner = &after[..end];
        let default = inner.split_once(":-").map(|(_, d)| d).unwrap_or("");
        out.push_str(default);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(parse("").is_err());
        assert!(parse("redis latest").is_err());
    }

    #[test]
    fn single_segment_expands_to_library() {
        let r = parse("redis").unwrap();
        assert_eq!(r.repository, "library/redis");
        assert_eq!(r.registry, None);
        assert_eq!(r.tag_or_default(), "latest");
    }

    #[test]
    fn hub_aliases_compare_equal() {
        let a = parse("redis").unwrap();
        let b = parse("docker.io/library/redis:latest").unwrap();
        assert!(a.canonical_aliases().is_superset(&HashSet::from([b.render()])) || b.canonical_aliases().contains(&a.render()));
    }

    #[test]
    fn digest_pin_detected() {
        let r = parse("myrepo/app@sha256:abcd1234").unwrap();
        assert!(r.is_digest_pinned());
        assert_eq!(r.tag, None);
    }

    #[test]
    fn registry_with_port_parsed() {
        let r = parse("registry.example.com:5000/team/app:v2").unwrap();
        assert_eq!(r.registry.as_deref(), Some("registry.example.com:5000"));
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn index_docker_io_normalizes_to_docker_io() {
        let r = parse("index.docker.io/library/redis:latest").unwrap();
        assert_eq!(r.registry.as_deref(), Some(DOCKER_HUB_REGISTRY));
    }

    #[test]
    fn env_substitution_default_becomes_tag() {
        let r = parse("myrepo/app:${TAG:-1.2.3}").unwrap();
        assert_eq!(r.tag.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn round_trip_stable() {
        for s in ["redis:latest", "myrepo/app:v1", "registry.example.com:5000/a/b:tag"] {
            let r = parse(s).unwrap();
            let rendered = r.render();
            let reparsed = parse(&rendered).unwrap();
            assert_eq!(r, reparsed);
        }
    }

    #[test]
    fn repository_root_is_first_segment() {
        let r = parse("myrepo/sub/app:v1").unwrap();
        assert_eq!(r.repository_root(), "myrepo");
    }
}
