use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::Element;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    InvalidXml(String),
    #[error("stream contained invalid UTF-8")]
    InvalidUtf8,
    #[error("expected exactly one XML element")]
    NotAStandaloneElement,
}

/// A complete unit read off the wire.
#[derive(Debug)]
pub enum Frame {
    /// The opening `<stream:stream>` tag, delivered before its children.
    StreamStart(Element),
    /// A complete first-level element (stanza or negotiation element).
    XmlFragment(Element),
    /// The closing `</stream:stream>` tag.
    StreamEnd,
}

/// Incremental parser for one XMPP stream. Bytes are fed as they arrive and
/// complete frames are pulled out; incomplete tails stay buffered until the
/// next read. `reset` starts a fresh stream on the same connection after
/// STARTTLS, SASL or compression restarts.
pub struct StreamParser {
    pending: Vec<u8>,
    buffer: String,
    root_open: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            buffer: String::new(),
            root_open: false,
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.buffer.clear();
        self.root_open = false;
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        self.pending.extend_from_slice(bytes);
        // Only the valid UTF-8 prefix moves into the text buffer; a
        // multi-byte character split across reads completes on the next feed.
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) => {
                if err.error_len().is_some() {
                    return Err(ParseError::InvalidUtf8);
                }
                err.valid_up_to()
            }
        };
        self.buffer
            .push_str(std::str::from_utf8(&self.pending[..valid_up_to]).unwrap_or(""));
        self.pending.drain(..valid_up_to);
        Ok(())
    }

    /// Returns the next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ParseError> {
        let mut reader = Reader::from_str(&self.buffer);
        reader.config_mut().check_end_names = true;
        let mut stack: Vec<Element> = Vec::new();

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(err) => {
                    // An error at the very end of the buffer is usually a
                    // truncated tag; wait for more bytes. Anywhere else the
                    // stream is malformed.
                    if reader.buffer_position() as usize >= self.buffer.len() {
                        return Ok(None);
                    }
                    return Err(ParseError::InvalidXml(err.to_string()));
                }
            };

            match event {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        let text = text
                            .unescape()
                            .map_err(|err| ParseError::InvalidXml(err.to_string()))?;
                        top.append_text(&text);
                    }
                    // whitespace keep-alives between stanzas are dropped
                }
                Event::CData(cdata) => {
                    if let Some(top) = stack.last_mut() {
                        top.append_text(&String::from_utf8_lossy(&cdata));
                    }
                }
                Event::Start(start) => {
                    let element = element_from_tag(&start)?;
                    if !self.root_open && stack.is_empty() {
                        self.root_open = true;
                        self.consume(reader.buffer_position() as usize);
                        return Ok(Some(Frame::StreamStart(element)));
                    }
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let element = element_from_tag(&start)?;
                    if !self.root_open && stack.is_empty() {
                        self.root_open = true;
                        self.consume(reader.buffer_position() as usize);
                        return Ok(Some(Frame::StreamStart(element)));
                    }
                    match stack.last_mut() {
                        Some(top) => top.add_child(element),
                        None => {
                            self.consume(reader.buffer_position() as usize);
                            return Ok(Some(Frame::XmlFragment(element)));
                        }
                    }
                }
                Event::End(_) => match stack.pop() {
                    Some(element) => match stack.last_mut() {
                        Some(top) => top.add_child(element),
                        None => {
                            self.consume(reader.buffer_position() as usize);
                            return Ok(Some(Frame::XmlFragment(element)));
                        }
                    },
                    None => {
                        self.consume(reader.buffer_position() as usize);
                        self.root_open = false;
                        return Ok(Some(Frame::StreamEnd));
                    }
                },
                Event::Eof => return Ok(None),
            }
        }
    }

    fn consume(&mut self, up_to: usize) {
        self.buffer.drain(..up_to);
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

fn element_from_tag(start: &BytesStart<'_>) -> Result<Element, ParseError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::new(&name);
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| ParseError::InvalidXml(err.to_string()))?;
        let label = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| ParseError::InvalidXml(err.to_string()))?;
        element.set_attribute(&label, &value);
    }
    Ok(element)
}

/// Parses a single element stored outside a stream context (offline
/// messages, archived notification payloads).
pub fn parse_standalone(xml: &str) -> Result<Element, ParseError> {
    let mut elements = parse_fragments(xml)?;
    if elements.len() != 1 {
        return Err(ParseError::NotAStandaloneElement);
    }
    Ok(elements.remove(0))
}

/// Parses a concatenation of complete elements.
pub fn parse_fragments(xml: &str) -> Result<Vec<Element>, ParseError> {
    let mut parser = StreamParser::new();
    parser.root_open = true;
    parser.feed(xml.as_bytes())?;

    let mut elements = Vec::new();
    while let Some(frame) = parser.next_frame()? {
        match frame {
            Frame::XmlFragment(element) => elements.push(element),
            Frame::StreamStart(_) | Frame::StreamEnd => {
                return Err(ParseError::NotAStandaloneElement)
            }
        }
    }
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_stream_start_before_children() {
        let mut parser = StreamParser::new();
        parser
            .feed(br#"<stream:stream to="localhost" xmlns="jabber:client" version="1.0">"#)
            .unwrap();

        let Some(Frame::StreamStart(root)) = parser.next_frame().unwrap() else {
            panic!("expected stream start");
        };
        assert_eq!(root.name(), "stream:stream");
        assert_eq!(root.to(), Some("localhost"));
        assert_eq!(root.attribute("version"), Some("1.0"));
        assert!(matches!(parser.next_frame().unwrap(), None));
    }

    #[test]
    fn buffers_partial_elements_across_feeds() {
        let mut parser = StreamParser::new();
        parser.feed(b"<stream:stream>").unwrap();
        parser.next_frame().unwrap();

        parser.feed(b"<message to=\"bob@loc").unwrap();
        assert!(matches!(parser.next_frame().unwrap(), None));

        parser.feed(b"alhost\"><body>hi</body></message>").unwrap();
        let Some(Frame::XmlFragment(message)) = parser.next_frame().unwrap() else {
            panic!("expected fragment");
        };
        assert_eq!(message.to(), Some("bob@localhost"));
        assert_eq!(message.find_child("body").unwrap().text(), "hi");
    }

    #[test]
    fn emits_stream_end_for_closing_root_tag() {
        let mut parser = StreamParser::new();
        parser.feed(b"<stream:stream><presence/></stream:stream>").unwrap();
        assert!(matches!(
            parser.next_frame().unwrap(),
            Some(Frame::StreamStart(_))
        ));
        assert!(matches!(
            parser.next_frame().unwrap(),
            Some(Frame::XmlFragment(_))
        ));
        assert!(matches!(parser.next_frame().unwrap(), Some(Frame::StreamEnd)));
    }

    #[test]
    fn rejects_malformed_xml_before_the_buffer_end() {
        let mut parser = StreamParser::new();
        parser.feed(b"<stream:stream>").unwrap();
        parser.next_frame().unwrap();
        parser.feed(b"<iq></presence><iq/>").unwrap();
        assert!(parser.next_frame().is_err());
    }

    #[test]
    fn keeps_xmlns_as_a_literal_attribute() {
        let element =
            parse_standalone(r#"<query xmlns="jabber:iq:roster"><item jid="a@b"/></query>"#)
                .unwrap();
        assert_eq!(element.namespace(), "jabber:iq:roster");
        assert_eq!(element.find_child("item").unwrap().namespace(), "");
    }

    #[test]
    fn parse_then_serialize_round_trips() {
        let xml = concat!(
            r#"<iq id="42" type="set" to="alice@localhost">"#,
            r#"<query xmlns="jabber:iq:roster">"#,
            r#"<item jid="bob@localhost" name="Bob"><group>pals</group></item>"#,
            r#"</query></iq>"#,
        );
        let element = parse_standalone(xml).unwrap();
        let reparsed = parse_standalone(&element.to_xml()).unwrap();
        assert_eq!(element, reparsed);
        assert_eq!(element.to_xml(), xml);
    }

    #[test]
    fn splits_utf8_characters_across_feeds() {
        let mut parser = StreamParser::new();
        parser.feed(b"<stream:stream>").unwrap();
        parser.next_frame().unwrap();

        let xml = "<message><body>\u{00e9}\u{00e9}</body></message>".as_bytes();
        let (head, tail) = xml.split_at(16); // inside the first two-byte char
        parser.feed(head).unwrap();
        assert!(matches!(parser.next_frame().unwrap(), None));
        parser.feed(tail).unwrap();
        let Some(Frame::XmlFragment(message)) = parser.next_frame().unwrap() else {
            panic!("expected fragment");
        };
        assert_eq!(message.find_child("body").unwrap().text(), "\u{00e9}\u{00e9}");
    }
}
