//! Service manifest discovery.
//!
//! Projects advertise buildable services through `podforge.json` manifests.
//! Discovery walks the configured source root a bounded number of levels
//! deep; each manifest contributes its services tagged with the project
//! directory that declared them.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

/// Manifest file name looked for during discovery.
pub const MANIFEST_NAME: &str = "podforge.json";

/// One buildable service declared by a project manifest.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Service {
    /// Image name pushed to the registry.
    pub name: String,
    /// Project the service belongs to; set from the manifest's directory.
    #[serde(default)]
    pub project: String,
    /// Service directory relative to the project root.
    pub path: String,
    /// Directory under `path` holding the service's Dockerfile.
    pub dockerfile: String,
    /// Build context relative to the project root.
    pub context: String,
}

/// Errors raised during service discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Raised when a directory or manifest cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a manifest does not decode as a service list.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Manifest that failed to decode.
        path: Utf8PathBuf,
        /// Decoder error string.
        message: String,
    },
    /// Raised when a path under the source root is not valid UTF-8.
    #[error("source path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the offending path.
        path: String,
    },
}

/// Walks `source_root` up to `search_depth` levels below it, collecting
/// every manifest's services.
///
/// # Errors
///
/// Returns [`DiscoveryError`] when the walk or a manifest read fails.
pub fn discover(source_root: &Utf8Path, search_depth: u16) -> Result<Vec<Service>, DiscoveryError> {
    let mut services = Vec::new();
    walk(source_root, 0, search_depth, &mut services)?;
    Ok(services)
}

/// Selects what a `build` argument refers to: a project name selects every
/// service the project declares, a service name selects just that service
/// within its project. Returns the project name and the selection, or
/// `None` when nothing matches.
#[must_use]
pub fn select(services: &[Service], name: &str) -> Option<(String, Vec<Service>)> {
    let of_project: Vec<Service> = services
        .iter()
        .filter(|service| service.project == name)
        .cloned()
        .collect();
    if !of_project.is_empty() {
        return Some((name.to_owned(), of_project));
    }

    services
        .iter()
        .find(|service| service.name == name)
        .map(|service| (service.project.clone(), vec![service.clone()]))
}

fn walk(
    dir: &Utf8Path,
    depth: u16,
    max_depth: u16,
    out: &mut Vec<Service>,
) -> Result<(), DiscoveryError> {
    let read_error = |message: String| DiscoveryError::Io {
        path: dir.to_owned(),
        message,
    };

    let mut children = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| read_error(err.to_string()))? {
        let entry = entry.map_err(|err| read_error(err.to_string()))?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| DiscoveryError::NonUtf8Path {
                path: name.to_string_lossy().into_owned(),
            })?;
        let file_type = entry
            .file_type()
            .map_err(|err| read_error(err.to_string()))?;
        children.push((name, file_type));
    }
    children.sort_by(|left, right| left.0.cmp(&right.0));

    for (name, file_type) in children {
        if file_type.is_file() && name == MANIFEST_NAME {
            load_manifest(&dir.join(&name), out)?;
        } else if file_type.is_dir() && depth < max_depth {
            walk(&dir.join(&name), depth + 1, max_depth, out)?;
        }
    }
    Ok(())
}

fn load_manifest(path: &Utf8Path, out: &mut Vec<Service>) -> Result<(), DiscoveryError> {
    let raw = fs::read_to_string(path).map_err(|err| DiscoveryError::Io {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    let mut listed: Vec<Service> =
        serde_json::from_str(&raw).map_err(|err| DiscoveryError::Parse {
            path: path.to_owned(),
            message: err.to_string(),
        })?;

    let project = path
        .parent()
        .and_then(Utf8Path::file_name)
        .unwrap_or_default()
        .to_owned();
    for service in &mut listed {
        service.project = project.clone();
    }
    out.append(&mut listed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    fn write_manifest(root: &Utf8Path, project_dir: &str, body: &str) {
        let dir = root.join(project_dir);
        fs::create_dir_all(&dir).expect("create project directory");
        fs::write(dir.join(MANIFEST_NAME), body).expect("write manifest");
    }

    fn source_root(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 temp path")
    }

    const SHOP_MANIFEST: &str = r#"[
        {"name": "shop-api", "path": "src/api", "dockerfile": "docker", "context": "."},
        {"name": "shop-web", "path": "src/web", "dockerfile": "docker", "context": "."}
    ]"#;

    #[test]
    fn discovery_tags_services_with_their_project_directory() {
        let tmp = TempDir::new().expect("temp dir");
        let root = source_root(&tmp);
        write_manifest(&root, "shop", SHOP_MANIFEST);

        let services = discover(&root, 2).expect("discovery should succeed");

        assert_eq!(services.len(), 2);
        assert!(services.iter().all(|service| service.project == "shop"));
    }

    #[test]
    fn discovery_respects_the_search_depth() {
        let tmp = TempDir::new().expect("temp dir");
        let root = source_root(&tmp);
        write_manifest(&root, "group/nested/shop", SHOP_MANIFEST);

        let shallow = discover(&root, 2).expect("shallow discovery should succeed");
        let deep = discover(&root, 3).expect("deep discovery should succeed");

        assert!(shallow.is_empty());
        assert_eq!(deep.len(), 2);
    }

    #[test]
    fn discovery_rejects_a_malformed_manifest() {
        let tmp = TempDir::new().expect("temp dir");
        let root = source_root(&tmp);
        write_manifest(&root, "shop", "not json");

        let err = discover(&root, 2).expect_err("malformed manifest should fail");

        assert!(matches!(err, DiscoveryError::Parse { .. }));
    }

    #[test]
    fn select_prefers_the_project_over_a_service_name() {
        let tmp = TempDir::new().expect("temp dir");
        let root = source_root(&tmp);
        write_manifest(&root, "shop", SHOP_MANIFEST);
        let services = discover(&root, 2).expect("discovery should succeed");

        let (project, selected) = select(&services, "shop").expect("project should match");
        assert_eq!(project, "shop");
        assert_eq!(selected.len(), 2);

        let (project, selected) = select(&services, "shop-api").expect("service should match");
        assert_eq!(project, "shop");
        assert_eq!(selected.len(), 1);

        assert!(select(&services, "missing").is_none());
    }
}
