use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JidError {
    #[error("could not parse JID: \"{0}\"")]
    Malformed(String),
}

/// An XMPP address. Three forms: server (`domain`), bare (`node@domain`)
/// and full (`node@domain/resource`). Node and domain are lowercased on
/// construction; the resource is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.map(|node| node.to_lowercase()),
            domain: domain.to_lowercase(),
            resource: resource.map(|resource| resource.to_string()),
        }
    }

    pub fn server(domain: &str) -> Self {
        Self::new(None, domain, None)
    }

    pub fn bare(node: &str, domain: &str) -> Self {
        Self::new(Some(node), domain, None)
    }

    pub fn full(node: &str, domain: &str, resource: &str) -> Self {
        Self::new(Some(node), domain, Some(resource))
    }

    pub fn node(&self) -> &str {
        self.node.as_deref().unwrap_or("")
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> &str {
        self.resource.as_deref().unwrap_or("")
    }

    pub fn is_server(&self) -> bool {
        self.node.is_none()
    }

    pub fn is_bare(&self) -> bool {
        self.node.is_some() && self.resource.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.node.is_some() && self.resource.is_some()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Binds a resource, turning a bare JID into a full one.
    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) => {
                if resource.is_empty() {
                    return Err(JidError::Malformed(s.to_string()));
                }
                (bare, Some(resource))
            }
            None => (s, None),
        };

        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) => {
                if node.is_empty() {
                    return Err(JidError::Malformed(s.to_string()));
                }
                (Some(node), domain)
            }
            None => (None, bare),
        };

        if domain.is_empty() || domain.contains('@') {
            return Err(JidError::Malformed(s.to_string()));
        }

        Ok(Jid::new(node, domain, resource))
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(ref node) = self.node {
            write!(f, "{}@", node)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(ref resource) = self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_forms() {
        let server = "localhost".parse::<Jid>().unwrap();
        assert!(server.is_server() && !server.is_bare() && !server.is_full());

        let bare = "alice@localhost".parse::<Jid>().unwrap();
        assert!(bare.is_bare());
        assert_eq!(bare.node(), "alice");
        assert_eq!(bare.domain(), "localhost");

        let full = "alice@localhost/phone".parse::<Jid>().unwrap();
        assert!(full.is_full());
        assert_eq!(full.resource(), "phone");
    }

    #[test]
    fn lowercases_node_and_domain_but_not_resource() {
        let jid = "Alice@LocalHost/Phone".parse::<Jid>().unwrap();
        assert_eq!(jid.node(), "alice");
        assert_eq!(jid.domain(), "localhost");
        assert_eq!(jid.resource(), "Phone");
    }

    #[test]
    fn fails_on_empty_or_malformed_input() {
        assert!("".parse::<Jid>().is_err());
        assert!("@localhost".parse::<Jid>().is_err());
        assert!("alice@localhost/".parse::<Jid>().is_err());
        assert!("alice@bob@localhost".parse::<Jid>().is_err());
    }

    #[test]
    fn resource_may_contain_slashes() {
        let jid = "alice@localhost/work/laptop".parse::<Jid>().unwrap();
        assert_eq!(jid.resource(), "work/laptop");
    }

    #[test]
    fn round_trips_through_display() {
        for s in ["localhost", "alice@localhost", "alice@localhost/phone"] {
            assert_eq!(s.parse::<Jid>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn compares_by_all_three_components() {
        let a = "alice@localhost/phone".parse::<Jid>().unwrap();
        let b = "ALICE@localhost/phone".parse::<Jid>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, a.to_bare());
        assert_eq!(a.to_bare(), "alice@localhost".parse::<Jid>().unwrap());
    }
}
