//! Pages (clients) within the worker's scope.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::lifecycle::ServiceWorkerId;
use crate::ServiceWorkerError;

/// A page or worker that can be controlled.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

impl Client {
    /// A new, uncontrolled window client.
    pub fn window(url: Url) -> Self {
        Self {
            id: format!("client-{}", uuid_simple()),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }

    /// Focus the client.
    pub fn focus(&mut self) -> Result<(), ServiceWorkerError> {
        if self.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        self.focused = true;
        Ok(())
    }

    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: Option<ClientType>,
}

/// Registry of clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Clients matching `options`, sorted by ID.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.is_controlled())
            .filter(|c| options.client_type.map_or(true, |t| c.client_type == t))
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// First window client whose URL equals `url`.
    pub fn find_by_url(&self, url: &Url) -> Option<&Client> {
        self.clients
            .values()
            .find(|c| c.client_type == ClientType::Window && &c.url == url)
    }

    /// Focus a client by ID.
    pub fn focus(&mut self, id: &str) -> Result<(), ServiceWorkerError> {
        if !self.clients.contains_key(id) {
            return Err(ServiceWorkerError::NotFound(format!("client {}", id)));
        }
        for (other_id, other) in self.clients.iter_mut() {
            if other_id == id {
                other.focus()?;
            } else {
                other.focused = false;
            }
        }
        Ok(())
    }

    /// Open a focused window on `url`, controlled by `controller`.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        for other in self.clients.values_mut() {
            other.focused = false;
        }
        let mut client = Client::window(url);
        client.focused = true;
        client.controller = controller;
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Make `worker` the controller of every client it doesn't already
    /// control. Returns the IDs of clients whose controller changed, sorted.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Clear the controller of every client `worker` controls. Returns how many.
    pub fn release(&mut self, worker: ServiceWorkerId) -> usize {
        let mut released = 0;
        for client in self.clients.values_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
                released += 1;
            }
        }
        released
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Generate a simple UUID-like string.
fn uuid_simple() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!("{:016x}-{:04x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(path: &str) -> Url {
        Url::parse("https://mpdigital.com/").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_claim_only_reports_changes() {
        let mut clients = Clients::new();
        let a = Client::window(page("/"));
        let b = Client::window(page("/blog.html"));
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        clients.add(a);
        clients.add(b);

        let old = ServiceWorkerId::next();
        let new = ServiceWorkerId::next();

        let mut expected = vec![a_id.clone(), b_id.clone()];
        expected.sort();
        assert_eq!(clients.claim(old), expected);
        assert!(clients.claim(old).is_empty());
        assert_eq!(clients.claim(new).len(), 2);
        assert_eq!(clients.get(&a_id).unwrap().controller, Some(new));

        assert_eq!(clients.release(old), 0);
        assert_eq!(clients.release(new), 2);
        assert!(!clients.get(&b_id).unwrap().is_controlled());
    }

    #[test]
    fn test_match_all_filters_uncontrolled() {
        let mut clients = Clients::new();
        clients.add(Client::window(page("/")));
        clients.open_window(page("/offline.html"), Some(ServiceWorkerId::next()));

        assert_eq!(clients.match_all(&ClientMatchOptions::default()).len(), 1);
        let all = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: Some(ClientType::Window),
        };
        assert_eq!(clients.match_all(&all).len(), 2);
    }

    #[test]
    fn test_focus_moves_between_windows() {
        let mut clients = Clients::new();
        let first = clients.open_window(page("/"), None);
        let second = clients.open_window(page("/blog.html"), None);
        assert!(!clients.get(&first.id).unwrap().focused);
        assert!(clients.get(&second.id).unwrap().focused);

        clients.focus(&first.id).unwrap();
        assert!(clients.get(&first.id).unwrap().focused);
        assert!(!clients.get(&second.id).unwrap().focused);

        assert!(matches!(
            clients.focus("client-missing"),
            Err(ServiceWorkerError::NotFound(_))
        ));
        assert_eq!(
            clients.find_by_url(&page("/blog.html")).map(|c| c.id.as_str()),
            Some(second.id.as_str())
        );
    }

    #[test]
    fn test_worker_clients_cannot_focus() {
        let mut client = Client::window(page("/"));
        client.client_type = ClientType::Worker;
        assert!(client.focus().is_err());
    }
}
