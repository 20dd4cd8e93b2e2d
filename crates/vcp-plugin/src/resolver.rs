//! Dependency resolution over the installed manifest set.
//!
//! The graph is rebuilt from scratch on every call; nothing is cached between
//! resolutions.

use semver::{Version, VersionReq};
use std::collections::{BTreeMap, HashMap};

use vcp_core::{Result, VcpError};

use crate::manifest::PluginManifest;

/// Adjacency list: plugin id → (dependency id, required range).
pub struct DependencyGraph {
    edges: BTreeMap<String, Vec<(String, String)>>,
    versions: HashMap<String, String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    pub fn build(manifests: &HashMap<String, PluginManifest>) -> Self {
        let edges = manifests
            .iter()
            .map(|(id, m)| {
                let deps = m
                    .dependencies
                    .iter()
                    .map(|(d, r)| (d.clone(), r.clone()))
                    .collect();
                (id.clone(), deps)
            })
            .collect();
        let versions = manifests
            .iter()
            .map(|(id, m)| (id.clone(), m.version.clone()))
            .collect();
        Self { edges, versions }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.edges
            .get(id)
            .map(|deps| deps.iter().map(|(d, _)| d.as_str()).collect())
            .unwrap_or_default()
    }

    /// Installed plugins that directly depend on `id`, sorted.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|(d, _)| d == id))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Dependency-first order for `roots` and everything they reach.
    ///
    /// Fails on an unknown root, a missing dependency, an unsatisfied version
    /// range, or a cycle anywhere in the closure (naming its members).
    pub fn resolve(&self, roots: &[String]) -> Result<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        let mut order = Vec::new();

        for root in roots {
            if !self.contains(root) {
                return Err(VcpError::PluginNotFound(root.clone()));
            }
            self.visit(root, &mut marks, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Err(VcpError::DependencyResolution {
                    reason: format!("circular dependency: {}", cycle.join(" -> ")),
                    plugins: path[start..].iter().map(|s| s.to_string()).collect(),
                });
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        path.push(id);

        if let Some(deps) = self.edges.get(id) {
            for (dep, range) in deps {
                let Some(found) = self.versions.get(dep) else {
                    return Err(VcpError::DependencyResolution {
                        reason: format!("'{id}' requires '{dep}' ({range}), which is not installed"),
                        plugins: vec![id.to_string(), dep.clone()],
                    });
                };
                if !satisfies(found, range) {
                    return Err(VcpError::DependencyResolution {
                        reason: format!("'{id}' requires '{dep}' {range}, found {found}"),
                        plugins: vec![id.to_string(), dep.clone()],
                    });
                }
                self.visit(dep, marks, path, order)?;
            }
        }

        path.pop();
        marks.insert(id, Mark::Done);
        order.push(id.to_string());
        Ok(())
    }
}

fn satisfies(version: &str, range: &str) -> bool {
    match (Version::parse(version), VersionReq::parse(range)) {
        (Ok(v), Ok(req)) => req.matches(&v),
        _ => false,
    }
}

/// Convenience wrapper: build the graph and resolve in one step.
pub fn resolve_dependencies(
    manifests: &HashMap<String, PluginManifest>,
    roots: &[String],
) -> Result<Vec<String>> {
    DependencyGraph::build(manifests).resolve(roots)
}
