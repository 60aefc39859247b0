use std::fmt::{self, Display, Formatter, Write};

use quick_xml::escape::escape;

pub mod namespaces;
pub mod parser;

/// An XML node attribute (label="value"). Attribute order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub label: String,
    pub value: String,
}

/// An XML node element. Namespace declarations are kept as literal `xmlns`
/// attributes and are never inherited onto child elements.
#[derive(Debug, Clone, Default)]
pub struct Element {
    name: String,
    text: String,
    attrs: Vec<Attribute>,
    children: Vec<Element>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn new_ns(name: &str, namespace: &str) -> Self {
        let mut element = Self::new(name);
        element.set_attribute("xmlns", namespace);
        element
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    pub fn append_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// The literal value of the `xmlns` attribute; empty when not declared.
    pub fn namespace(&self) -> &str {
        self.attribute("xmlns").unwrap_or("")
    }

    pub fn attribute(&self, label: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|attr| attr.label == label)
            .map(|attr| attr.value.as_str())
    }

    pub fn set_attribute(&mut self, label: &str, value: &str) {
        for attr in &mut self.attrs {
            if attr.label == label {
                attr.value = value.to_string();
                return;
            }
        }
        self.attrs.push(Attribute {
            label: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn remove_attribute(&mut self, label: &str) {
        self.attrs.retain(|attr| attr.label != label);
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn attributes_count(&self) -> usize {
        self.attrs.len()
    }

    pub fn id(&self) -> Option<&str> {
        self.attribute("id")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.attribute("type")
    }

    pub fn to(&self) -> Option<&str> {
        self.attribute("to")
    }

    pub fn from(&self) -> Option<&str> {
        self.attribute("from")
    }

    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn find_child_ns(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|child| child.name == name && child.namespace() == namespace)
    }

    pub fn find_children(&self, name: &str) -> Vec<&Element> {
        self.children
            .iter()
            .filter(|child| child.name == name)
            .collect()
    }

    pub fn find_children_ns(&self, name: &str, namespace: &str) -> Vec<&Element> {
        self.children
            .iter()
            .filter(|child| child.name == name && child.namespace() == namespace)
            .collect()
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn children_count(&self) -> usize {
        self.children.len()
    }

    pub fn add_child(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn add_children(&mut self, children: Vec<Element>) {
        self.children.extend(children);
    }

    pub fn insert_child(&mut self, index: usize, child: Element) {
        self.children.insert(index, child);
    }

    pub fn with_child<F>(&mut self, name: &str, namespace: Option<&str>, f: F)
    where
        F: FnOnce(&mut Element),
    {
        let mut child = match namespace {
            Some(namespace) => Element::new_ns(name, namespace),
            None => Element::new(name),
        };
        f(&mut child);
        self.children.push(child);
    }

    pub fn remove_children(&mut self, name: &str) {
        self.children.retain(|child| child.name != name);
    }

    pub fn remove_children_ns(&mut self, name: &str, namespace: &str) {
        self.children
            .retain(|child| child.name != name || child.namespace() != namespace);
    }

    pub fn validate(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace() == namespace
    }

    /// Serializes the element including its closing tag.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        self.write_xml(&mut xml, true);
        xml
    }

    /// Serializes only the opening tag, for root elements that stay open.
    pub fn open_tag_xml(&self) -> String {
        let mut xml = String::new();
        self.write_xml(&mut xml, false);
        xml
    }

    fn write_xml(&self, xml: &mut String, include_closing: bool) {
        let _ = write!(xml, "<{}", self.name);
        for attr in &self.attrs {
            let _ = write!(xml, " {}=\"{}\"", attr.label, escape(&attr.value));
        }
        if self.text.is_empty() && self.children.is_empty() {
            if include_closing {
                xml.push_str("/>");
            } else {
                xml.push('>');
            }
            return;
        }
        xml.push('>');
        if !self.text.is_empty() {
            xml.push_str(&escape(&self.text));
        }
        for child in &self.children {
            child.write_xml(xml, true);
        }
        if include_closing {
            let _ = write!(xml, "</{}>", self.name);
        }
    }
}

// Attribute order carries no meaning, so equality treats attributes as a set.
impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name
            || self.text != other.text
            || self.attrs.len() != other.attrs.len()
            || self.children != other.children
        {
            return false;
        }
        self.attrs
            .iter()
            .all(|attr| other.attribute(&attr.label) == Some(attr.value.as_str()))
    }
}

impl Eq for Element {}

impl Display for Element {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_is_the_literal_xmlns_attribute() {
        let element = Element::new_ns("query", "jabber:iq:roster");
        assert_eq!(element.namespace(), "jabber:iq:roster");
        assert_eq!(Element::new("query").namespace(), "");
    }

    #[test]
    fn set_attribute_replaces_existing_value() {
        let mut element = Element::new("iq");
        element.set_attribute("type", "get");
        element.set_attribute("type", "set");
        assert_eq!(element.attribute("type"), Some("set"));
        assert_eq!(element.attributes_count(), 1);
    }

    #[test]
    fn find_children_filters_by_name() {
        let mut element = Element::new("query");
        element.add_child(Element::new("item"));
        element.add_child(Element::new("group"));
        element.add_child(Element::new("item"));
        assert_eq!(element.find_children("item").len(), 2);
        assert_eq!(element.children_count(), 3);

        element.remove_children("item");
        assert_eq!(element.children_count(), 1);
        assert_eq!(element.children()[0].name(), "group");
    }

    #[test]
    fn serializes_self_closing_and_nested_elements() {
        let mut presence = Element::new("presence");
        presence.set_attribute("from", "alice@localhost/phone");
        presence.with_child("show", None, |show| show.set_text("away"));
        assert_eq!(
            presence.to_xml(),
            r#"<presence from="alice@localhost/phone"><show>away</show></presence>"#
        );
        assert_eq!(Element::new("ping").to_xml(), "<ping/>");
    }

    #[test]
    fn escapes_text_and_attribute_values() {
        let mut message = Element::new("message");
        message.set_attribute("from", "\"ali&ce\"");
        message.with_child("body", None, |body| body.set_text("1 < 2 & 3 > 2"));
        let xml = message.to_xml();
        assert!(xml.contains("&quot;ali&amp;ce&quot;"));
        assert!(xml.contains("1 &lt; 2 &amp; 3 &gt; 2"));
    }

    #[test]
    fn equality_ignores_attribute_order() {
        let mut a = Element::new("iq");
        a.set_attribute("id", "42");
        a.set_attribute("type", "get");
        let mut b = Element::new("iq");
        b.set_attribute("type", "get");
        b.set_attribute("id", "42");
        assert_eq!(a, b);

        b.set_attribute("id", "43");
        assert_ne!(a, b);
    }
}
