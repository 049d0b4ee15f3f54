//! Request classification and strategy selection.
//!
//! Every intercepted request is classified exactly once into a
//! [`RequestClass`]; the class, not the raw request, decides the
//! [`Strategy`]. Classes are mutually exclusive, so an API URL can never
//! land in the static partition and vice versa.

use sitecache_net::{Request, RequestMode};
use url::Url;

use crate::config::{StaticStrategy, WorkerConfig};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico"];

/// What kind of resource a GET is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// API/data endpoint.
    Api,
    /// Page navigation (HTML).
    Navigation,
    /// Image.
    Image,
    /// Any other same-origin asset.
    Static,
    /// Asset on another origin (CDN fonts, stylesheets).
    CrossOrigin,
}

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    StaleWhileRevalidate,
    NetworkFirst,
    NetworkOnly,
}

/// Routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; goes to the network untouched.
    Passthrough,
    /// Served by the worker.
    Handle { class: RequestClass, strategy: Strategy },
}

/// Request router.
#[derive(Debug, Clone)]
pub struct Router {
    origin: Url,
    api_markers: Vec<String>,
    static_strategy: Strategy,
}

impl Router {
    pub fn new(config: &WorkerConfig) -> Self {
        let static_strategy = match config.static_strategy {
            StaticStrategy::CacheFirst => Strategy::CacheFirst,
            StaticStrategy::StaleWhileRevalidate => Strategy::StaleWhileRevalidate,
        };
        Self {
            origin: config.origin.clone(),
            api_markers: config.api_markers.clone(),
            static_strategy,
        }
    }

    /// Classify a GET. Non-GET requests have no class.
    pub fn classify(&self, request: &Request) -> Option<RequestClass> {
        if !request.is_get() {
            return None;
        }

        let path = request.url.path();
        let class = if self.api_markers.iter().any(|marker| path.contains(marker.as_str())) {
            RequestClass::Api
        } else if request.mode == RequestMode::Navigate || request.accepts("text/html") {
            RequestClass::Navigation
        } else if request.accepts("image") || has_image_extension(path) {
            RequestClass::Image
        } else if request.url.origin() != self.origin.origin() {
            RequestClass::CrossOrigin
        } else {
            RequestClass::Static
        };
        Some(class)
    }

    /// Decide how to serve a request.
    pub fn route(&self, request: &Request) -> Route {
        match self.classify(request) {
            None => Route::Passthrough,
            Some(class) => Route::Handle {
                class,
                strategy: self.strategy_for(class),
            },
        }
    }

    fn strategy_for(&self, class: RequestClass) -> Strategy {
        match class {
            RequestClass::Api => Strategy::NetworkFirst,
            RequestClass::CrossOrigin => Strategy::NetworkOnly,
            RequestClass::Navigation | RequestClass::Image | RequestClass::Static => {
                self.static_strategy
            }
        }
    }
}

fn has_image_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
