//! Service name -> local port table, kept in registration order.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBindings {
    entries: Vec<(String, u16)>,
}

impl PortBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding. Re-binding a service keeps its original position.
    /// Returns the previous port, if any.
    pub fn bind(&mut self, service: impl Into<String>, port: u16) -> Option<u16> {
        let service = service.into();
        match self.entries.iter_mut().find(|(s, _)| *s == service) {
            Some((_, existing)) => Some(std::mem::replace(existing, port)),
            None => {
                self.entries.push((service, port));
                None
            }
        }
    }

    pub fn unbind(&mut self, service: &str) -> Option<u16> {
        let idx = self.entries.iter().position(|(s, _)| s == service)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get(&self, service: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|(s, _)| s == service)
            .map(|(_, port)| *port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.entries.iter().map(|(s, p)| (s.as_str(), *p))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
