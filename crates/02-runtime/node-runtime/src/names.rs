//! Deterministic bus names derived from a type base name and optional id.
//!
//! Client and server compute the same names independently, so no discovery
//! step is needed beyond a plain lookup.

const DOMAIN: &str = "org.vdev";
const RELAY_SUFFIX: &str = "Relay";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceNames {
    base: String,
    id: Option<u32>,
    service: String,
    path: String,
    interface: String,
    relay_rule: String,
}

impl ServiceNames {
    pub fn new(base: &str, id: Option<u32>) -> Self {
        let interface = format!("{DOMAIN}.{base}");
        let (service, path) = match id {
            Some(id) => (
                format!("{interface}.{id}"),
                format!("/{}/{base}/{id}", DOMAIN.replace('.', "/")),
            ),
            None => (
                interface.clone(),
                format!("/{}/{base}", DOMAIN.replace('.', "/")),
            ),
        };
        let relay_rule = format!("{service}.{RELAY_SUFFIX}");
        Self {
            base: base.to_owned(),
            id,
            service,
            path,
            interface,
            relay_rule,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Signal member used by this connection's relay.
    pub fn relay_rule(&self) -> &str {
        &self.relay_rule
    }

    /// Short name suitable for a worker thread.
    pub fn thread_name(&self) -> String {
        match self.id {
            Some(id) => format!("{}-{id}", self.base),
            None => self.base.clone(),
        }
    }
}
