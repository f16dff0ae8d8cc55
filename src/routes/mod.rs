//! Route table and persistence
//!
//! A route names where this node listens (`bind_ip`/`bind_port`) and where
//! it dials on behalf of a new flow (`backend_ip`/`backend_port`), plus the
//! PROXY-header policy for the outbound leg. Routes load from `routes.json`
//! in the working directory; mutations from the control plane are applied
//! in place and persisted atomically.
//!
//! Entries are handed out as `Arc<RwLock<Route>>` so a running listener
//! keeps a stable reference while address fields change beneath it. A
//! changed backend address affects only future dials.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

/// Default routes file name, relative to the working directory
pub const ROUTES_FILE: &str = "routes.json";

/// Route store errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("failed to read routes file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to persist routes file: {0}")]
    Persist(#[source] std::io::Error),

    #[error("cannot parse routes file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("route not found: {0}")]
    NotFound(String),
}

/// Whether a PROXY header is emitted on the outbound leg of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyMode {
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2")]
    V2,
}

/// A single route entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,

    pub bind_ip: String,
    pub bind_port: u16,

    pub haproxy: ProxyMode,

    #[serde(default)]
    pub backend_ip: String,
    #[serde(default)]
    pub backend_port: u16,
}

impl Route {
    /// Address this node listens on for the route
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.bind_port)
    }

    /// Address this node dials for a new flow on the route
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_ip, self.backend_port)
    }
}

/// Shared handle to a live route entry
pub type SharedRoute = Arc<RwLock<Route>>;

/// Mapping `route_id -> Route` backed by `routes.json`
pub struct RouteStore {
    routes: RwLock<HashMap<String, SharedRoute>>,
    path: PathBuf,
    /// Serializes mutations against persist, so a snapshot never sees a
    /// half-applied update
    write_lock: std::sync::Mutex<()>,
}

impl RouteStore {
    /// Load the store from disk. A missing file writes a default one-route
    /// store and continues; an unparseable file is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RouteError> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let store = Self {
                routes: RwLock::new(HashMap::new()),
                path,
                write_lock: std::sync::Mutex::new(()),
            };
            store.insert(Route {
                route_id: "default".to_string(),
                bind_ip: "localhost".to_string(),
                bind_port: 8080,
                haproxy: ProxyMode::Off,
                backend_ip: String::new(),
                backend_port: 0,
            });
            store.persist()?;
            info!("No routes file found, wrote default route store");
            return Ok(store);
        }

        let content = std::fs::read_to_string(&path).map_err(RouteError::Read)?;
        let routes: Vec<Route> = serde_json::from_str(&content)?;

        let map = routes
            .into_iter()
            .map(|r| (r.route_id.clone(), Arc::new(RwLock::new(r))))
            .collect::<HashMap<_, _>>();

        info!(route_count = map.len(), "Loaded routes from disk");

        Ok(Self {
            routes: RwLock::new(map),
            path,
            write_lock: std::sync::Mutex::new(()),
        })
    }

    fn insert(&self, route: Route) {
        self.routes
            .write()
            .unwrap()
            .insert(route.route_id.clone(), Arc::new(RwLock::new(route)));
    }

    /// Look up a route by id
    pub fn get(&self, route_id: &str) -> Option<SharedRoute> {
        self.routes.read().unwrap().get(route_id).cloned()
    }

    /// Visit every route entry
    pub fn each<F: FnMut(&SharedRoute)>(&self, mut f: F) {
        for route in self.routes.read().unwrap().values() {
            f(route);
        }
    }

    /// All route ids currently in the store
    pub fn route_ids(&self) -> Vec<String> {
        self.routes.read().unwrap().keys().cloned().collect()
    }

    /// Number of routes in the store
    pub fn len(&self) -> usize {
        self.routes.read().unwrap().len()
    }

    /// Whether the store holds no routes
    pub fn is_empty(&self) -> bool {
        self.routes.read().unwrap().is_empty()
    }

    /// Rewrite the backend IP of a route. Future dials pick up the new
    /// address; live flows are untouched.
    pub fn set_backend_ip(&self, route_id: &str, ip: &str) -> Result<(), RouteError> {
        let _guard = self.write_lock.lock().unwrap();
        let route = self
            .get(route_id)
            .ok_or_else(|| RouteError::NotFound(route_id.to_string()))?;
        route.write().unwrap().backend_ip = ip.to_string();
        Ok(())
    }

    /// Rewrite the bind address of a route. Takes effect on the next start;
    /// a running listener keeps its socket.
    pub fn set_bind(&self, route_id: &str, ip: &str, port: u16) -> Result<(), RouteError> {
        let _guard = self.write_lock.lock().unwrap();
        let route = self
            .get(route_id)
            .ok_or_else(|| RouteError::NotFound(route_id.to_string()))?;
        let mut route = route.write().unwrap();
        route.bind_ip = ip.to_string();
        route.bind_port = port;
        Ok(())
    }

    /// Write the current route set to disk atomically (temp file + rename)
    pub fn persist(&self) -> Result<(), RouteError> {
        let _guard = self.write_lock.lock().unwrap();
        let snapshot: Vec<Route> = {
            let routes = self.routes.read().unwrap();
            let mut list: Vec<Route> = routes.values().map(|r| r.read().unwrap().clone()).collect();
            list.sort_by(|a, b| a.route_id.cmp(&b.route_id));
            list
        };

        let content = serde_json::to_string_pretty(&snapshot)?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &content).map_err(RouteError::Persist)?;
        std::fs::rename(&tmp_path, &self.path).map_err(RouteError::Persist)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("backhaul-routes-{}-{}", std::process::id(), name))
    }

    fn sample_route(id: &str) -> Route {
        Route {
            route_id: id.to_string(),
            bind_ip: "0.0.0.0".to_string(),
            bind_port: 25565,
            haproxy: ProxyMode::V2,
            backend_ip: "10.0.0.5".to_string(),
            backend_port: 25566,
        }
    }

    #[test]
    fn test_missing_file_writes_default_store() {
        let path = temp_path("default.json");
        let _ = std::fs::remove_file(&path);

        let store = RouteStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);

        let route = store.get("default").unwrap();
        let route = route.read().unwrap();
        assert_eq!(route.bind_ip, "localhost");
        assert_eq!(route.bind_port, 8080);
        assert_eq!(route.haproxy, ProxyMode::Off);
        assert!(path.exists());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_persist_roundtrip() {
        let path = temp_path("roundtrip.json");
        let _ = std::fs::remove_file(&path);

        let store = RouteStore::load(&path).unwrap();
        store.insert(sample_route("mc"));
        store.persist().unwrap();

        let reloaded = RouteStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let route = reloaded.get("mc").unwrap();
        assert_eq!(route.read().unwrap().haproxy, ProxyMode::V2);
        assert_eq!(route.read().unwrap().backend_addr(), "10.0.0.5:25566");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_mutation_visible_through_stable_reference() {
        let path = temp_path("mutate.json");
        let _ = std::fs::remove_file(&path);

        let store = RouteStore::load(&path).unwrap();
        store.insert(sample_route("mc"));

        // A listener would hold this handle across the mutation
        let held = store.get("mc").unwrap();

        store.set_backend_ip("mc", "9.9.9.9").unwrap();
        assert_eq!(held.read().unwrap().backend_ip, "9.9.9.9");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_set_bind_unknown_route() {
        let path = temp_path("unknown.json");
        let _ = std::fs::remove_file(&path);

        let store = RouteStore::load(&path).unwrap();
        assert!(matches!(
            store.set_bind("nope", "1.2.3.4", 80),
            Err(RouteError::NotFound(_))
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_proxy_mode_serde_literals() {
        let json = r#"{"route_id":"r","bind_ip":"::","bind_port":1,"haproxy":"v1"}"#;
        let route: Route = serde_json::from_str(json).unwrap();
        assert_eq!(route.haproxy, ProxyMode::V1);
        assert_eq!(route.backend_port, 0);

        let back = serde_json::to_string(&route).unwrap();
        assert!(back.contains(r#""haproxy":"v1""#));
    }
}
