//! Minimal XML element tree shared by program, query and result documents.
//!
//! # Responsibility
//! - Parse a document into an owned element tree with `quick-xml` events.
//! - Render an element tree back to indented XML.
//!
//! # Invariants
//! - Whitespace-only text between elements is dropped.
//! - Child order is preserved exactly; program semantics depend on it.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// XML parse/render error with the underlying parser message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError(pub String);

impl Display for XmlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed XML: {}", self.0)
    }
}

impl Error for XmlError {}

/// One element with attributes, child elements and concatenated text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder: appends an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Builder: sets the text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder: appends a child element.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Appends `<name>text</name>` when `text` is present.
    pub fn push_text_child(&mut self, name: &str, text: Option<impl ToString>) {
        if let Some(text) = text {
            self.children.push(XmlElement::new(name).with_text(text.to_string()));
        }
    }

    /// Returns an attribute value by name.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the first child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Returns the trimmed text of the first child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|child| child.text.trim())
            .filter(|text| !text.is_empty())
    }

    /// Returns the trimmed text of this element.
    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }
}

/// Parses a document and returns its root element.
pub fn parse_document(xml: &str) -> Result<XmlElement, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| XmlError(format!("{err} at byte {}", reader.buffer_position())))?;
        match event {
            Event::Start(start) => stack.push(element_from_start(&start)?),
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| XmlError("unbalanced closing tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(|err| XmlError(err.to_string()))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&value);
                }
            }
            Event::CData(data) => {
                let bytes = data.into_inner();
                let value = std::str::from_utf8(&bytes).map_err(|err| XmlError(err.to_string()))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(XmlError("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| XmlError("document has no root element".to_string()))
}

/// Renders an element tree as an indented document with an XML declaration.
pub fn render_document(root: &XmlElement) -> Result<String, XmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
            "1.0",
            Some("UTF-8"),
            None,
        )))
        .map_err(|err| XmlError(err.to_string()))?;
    write_element(&mut writer, root)?;
    String::from_utf8(writer.into_inner()).map_err(|err| XmlError(err.to_string()))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &XmlElement) -> Result<(), XmlError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|err| XmlError(err.to_string()));
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|err| XmlError(err.to_string()))?;
    if !element.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(element.text.as_str())))
            .map_err(|err| XmlError(err.to_string()))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|err| XmlError(err.to_string()))
}

fn element_from_start(start: &BytesStart<'_>) -> Result<XmlElement, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = XmlElement::new(name);
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| XmlError(err.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| XmlError(err.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(XmlError("document has more than one root element".to_string()));
    }
    *root = Some(element);
    Ok(())
}
